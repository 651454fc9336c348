use log::info;
use shared::{FrameBuffer, Message, READ_BUFFER_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A client's connection to the game server.
///
/// Wraps the TCP stream together with the frame reassembly buffer, so
/// callers deal in whole messages regardless of how the bytes arrive.
pub struct Connection {
    stream: TcpStream,
    frames: FrameBuffer,
}

impl Connection {
    pub async fn connect(addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(addr).await?;
        info!("Connected to server at {}", addr);

        Ok(Connection {
            stream,
            frames: FrameBuffer::new(),
        })
    }

    pub async fn send(&mut self, message: &Message) -> std::io::Result<()> {
        self.stream.write_all(&message.encode()).await
    }

    /// Next message from the server, or `None` once the connection closed.
    pub async fn next_message(&mut self) -> Result<Option<Message>, Box<dyn std::error::Error>> {
        let mut chunk = [0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(frame) = self.frames.next_frame()? {
                return Ok(Some(Message::decode(&frame)?));
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.frames.extend(&chunk[..n]);
        }
    }

    pub async fn register(&mut self, username: &str) -> std::io::Result<()> {
        self.send(&Message::UserCreation {
            username: username.to_string(),
        })
        .await
    }

    pub async fn request_user_list(&mut self) -> std::io::Result<()> {
        self.send(&Message::GetUserList).await
    }

    pub async fn request_match(&mut self, target_id: u32) -> std::io::Result<()> {
        self.send(&Message::MatchRequest { target_id }).await
    }

    pub async fn respond(&mut self, accept: bool) -> std::io::Result<()> {
        self.send(&Message::MatchResponse { accept }).await
    }

    pub async fn cancel_match(&mut self) -> std::io::Result<()> {
        self.send(&Message::MatchCancellation).await
    }

    pub async fn play(&mut self, house: usize) -> std::io::Result<()> {
        self.send(&Message::GameMove {
            house: house as i32,
        })
        .await
    }

    /// Sends a chat line. The server stamps the sender fields itself, so
    /// whatever is put there on the way out is ignored.
    pub async fn chat(&mut self, text: &str) -> std::io::Result<()> {
        self.send(&Message::Chat {
            text: text.to_string(),
            sender_name: String::new(),
            sender_id: 0,
        })
        .await
    }

    pub async fn observe(&mut self, target_id: u32) -> std::io::Result<()> {
        self.send(&Message::ObserveRequest { target_id }).await
    }

    pub async fn stop_observing(&mut self) -> std::io::Result<()> {
        self.send(&Message::StopObserving).await
    }
}
