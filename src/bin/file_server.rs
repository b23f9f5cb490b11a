use anyhow::{Context, Result};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};
use tracing::{info, warn};

/// Shared chat log server: VIEW and POST over line-delimited TCP
#[derive(Parser, Debug)]
#[command(version, about)]
struct ServerConfig {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:50000")]
    listen: String,

    /// File the chat log is appended to
    #[arg(short, long, default_value = "chat_log.txt")]
    chat_file: PathBuf,
}

// All access goes through one lock so a VIEW never reads a torn POST.
struct ChatLog {
    path: PathBuf,
}

impl ChatLog {
    async fn view(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.is_empty() => Ok("[No messages yet]".to_string()),
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok("[Chat room is empty]".to_string())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, message: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {:?}", self.path))?;
        file.write_all(message.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::parse();
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!("file server listening on {}", config.listen);
    info!("chat log file: {:?}", config.chat_file);

    let log = Arc::new(Mutex::new(ChatLog {
        path: config.chat_file,
    }));
    loop {
        let (stream, addr) = listener.accept().await?;
        let log = log.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, addr, log).await {
                warn!("client {addr}: {e}");
            }
        });
    }
}

// One command per connection: read a line, answer, close.
async fn handle_client(stream: TcpStream, addr: SocketAddr, log: Arc<Mutex<ChatLog>>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut request = String::new();
    // a command line larger than this is not worth reading
    BufReader::new(read_half.take(4096)).read_line(&mut request).await?;
    let request = request.trim_end();
    if request.is_empty() {
        warn!("no data received from {addr}");
        return Ok(());
    }

    let (command, payload) = request.split_once(' ').unwrap_or((request, ""));
    let response = match command {
        "VIEW" => {
            info!("VIEW from {addr}");
            log.lock().await.view().await?
        }
        "POST" => {
            if payload.is_empty() {
                warn!("POST with no payload from {addr}");
                "ERROR: No message provided".to_string()
            } else {
                info!("POST from {addr}");
                log.lock().await.append(payload).await?;
                "OK: Message posted".to_string()
            }
        }
        other => {
            warn!("unknown command {other:?} from {addr}");
            "ERROR: Unknown command".to_string()
        }
    };

    write_half.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("dchat-file-server-{}-{}", name, std::process::id()));
        path
    }

    #[tokio::test]
    async fn view_of_missing_log_reports_empty_room() {
        let log = ChatLog {
            path: scratch_file("missing"),
        };
        assert_eq!(log.view().await.unwrap(), "[Chat room is empty]");
    }

    #[tokio::test]
    async fn post_then_view_round_trips() {
        let path = scratch_file("roundtrip");
        let _ = std::fs::remove_file(&path);
        let log = ChatLog { path: path.clone() };
        log.append("01 Jan 09:00AM a: hello").await.unwrap();
        log.append("01 Jan 09:01AM b: hi").await.unwrap();
        let content = log.view().await.unwrap();
        assert_eq!(content, "01 Jan 09:00AM a: hello\n01 Jan 09:01AM b: hi\n");
        let _ = std::fs::remove_file(&path);
    }
}
