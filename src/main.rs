use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dchat::{Config, DmeHandle, Node};
use std::time::{Duration, Instant};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};
use tracing::{error, info, warn};

const SERVER_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::parse();
    let node_id = config.node_id.clone();
    let server_addr = config.server.clone();

    info!("starting chat client {}", node_id);
    info!("file server at {}", server_addr);
    if config.peers.is_empty() {
        warn!("no peers configured, write access will be uncontested");
    }

    let (mut node, lock) = Node::new(config).await?;
    tokio::spawn(async move {
        if let Err(e) = node.run().await {
            error!("node task failed: {e}");
        }
    });

    println!("Welcome, {node_id}.");
    println!("Commands: 'view', 'post <message>', 'exit'.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_prompt(&node_id);
        let Some(line) = lines.next_line().await? else { break };
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "" => {}
            "view" => handle_view(&server_addr).await,
            "post" => {
                let text = rest.trim();
                if text.is_empty() {
                    println!("Usage: post <your message here>");
                } else {
                    handle_post(&server_addr, &node_id, text, &lock).await?;
                }
            }
            "exit" => break,
            other => println!("Unknown command: '{other}'"),
        }
    }

    info!("exiting");
    println!("Goodbye!");
    Ok(())
}

fn print_prompt(node_id: &str) {
    use std::io::Write;
    print!("{node_id}> ");
    let _ = std::io::stdout().flush();
}

// Reading the log takes no lock; a view never waits on a poster.
async fn handle_view(server_addr: &str) {
    println!("Fetching chat log from server...");
    match talk_to_server(server_addr, "VIEW").await {
        Ok(content) => {
            println!("--- Chat Log ---");
            println!("{content}");
            println!("----------------");
        }
        Err(e) => error!("view failed: {e}"),
    }
}

// Posting is the critical section: acquire, append on the server, release.
async fn handle_post(server_addr: &str, node_id: &str, text: &str, lock: &DmeHandle) -> Result<()> {
    println!("Waiting for write access...");
    let started = Instant::now();
    lock.acquire().await.context("could not acquire write access")?;
    info!("acquired write lock in {:?}", started.elapsed());

    let stamp = chrono::Local::now().format("%d %b %I:%M%p");
    let message = format!("{stamp} {node_id}: {text}");
    let result = talk_to_server(server_addr, &format!("POST {message}")).await;

    // the lock is released however the post went
    lock.release().await?;

    match result {
        Ok(response) => println!("Server response: {response}"),
        Err(e) => error!("post failed: {e}"),
    }
    Ok(())
}

// One connection per command: send the request line, read until the server
// closes, like the file server expects.
async fn talk_to_server(addr: &str, request: &str) -> Result<String> {
    timeout(SERVER_TIMEOUT, async {
        let mut stream = TcpStream::connect(addr)
            .await
            .context("connecting to file server")?;
        stream.write_all(request.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok(response)
    })
    .await
    .map_err(|_| anyhow!("file server timed out"))?
}
