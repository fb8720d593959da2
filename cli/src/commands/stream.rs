//! `editor-fleet stream` - follow a streaming operation on a node.

use anyhow::Context;
use clap::{Args, ValueEnum};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::error::CliError;
use crate::output::display_frame;

/// Streaming operations a node exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StreamOperation {
    /// Render a thumbnail with step progress
    Thumbnail,
    /// Multi-step automated retouch
    Retouch,
}

impl StreamOperation {
    fn endpoint(self) -> &'static str {
        match self {
            Self::Thumbnail => "/thumbnail/stream",
            Self::Retouch => "/retouch/stream",
        }
    }
}

/// Arguments for `stream`.
#[derive(Debug, Args)]
pub struct StreamArgs {
    /// Which streaming operation to run
    #[arg(value_enum)]
    pub operation: StreamOperation,

    /// Node address (host:port)
    #[arg(long, default_value = "127.0.0.1:7401")]
    pub node: String,

    /// Path of the document to operate on
    #[arg(long)]
    pub path: Option<String>,

    /// Thumbnail width
    #[arg(long, default_value_t = 256)]
    pub width: u32,

    /// Thumbnail height
    #[arg(long, default_value_t = 256)]
    pub height: u32,

    /// Thumbnail format (jpeg or png)
    #[arg(long, default_value = "jpeg")]
    pub format: String,

    /// Retouch instructions, comma-separated
    #[arg(long, value_delimiter = ',')]
    pub instructions: Option<Vec<String>>,
}

/// Connect to the node and print frames until the terminal one.
pub async fn execute(args: StreamArgs, _verbose: bool) -> Result<(), CliError> {
    let url = format!("ws://{}{}", args.node, args.operation.endpoint());
    let (mut socket, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|err| CliError::DispatcherUnreachable {
            address: url.clone(),
            source: Some(err.into()),
        })?;

    let request = match args.operation {
        StreamOperation::Thumbnail => serde_json::json!({
            "path": args.path,
            "width": args.width,
            "height": args.height,
            "format": args.format,
        }),
        StreamOperation::Retouch => serde_json::json!({
            "path": args.path,
            "instructions": args.instructions,
        }),
    };
    socket
        .send(Message::Text(request.to_string()))
        .await
        .context("failed to send stream request")?;

    while let Some(message) = socket.next().await {
        match message.context("stream transport failed")? {
            Message::Text(text) => {
                let frame: serde_json::Value =
                    serde_json::from_str(&text).context("invalid frame")?;
                let terminal = frame["type"] == "complete" || frame["type"] == "error";
                display_frame(&frame);
                if terminal {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
