//! Terminal sink: streamed text to stdout, user lines from stdin

use async_trait::async_trait;
use palaver_core::{Sink, SinkError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::Mutex;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

pub struct StdioSink {
    stdout: Mutex<Stdout>,
    lines: Mutex<LinesStream<BufReader<Stdin>>>,
}

impl StdioSink {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
            lines: Mutex::new(LinesStream::new(BufReader::new(tokio::io::stdin()).lines())),
        }
    }
}

#[async_trait]
impl Sink for StdioSink {
    async fn write(&self, text: &str) -> Result<(), SinkError> {
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(text.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }

    async fn write_line(&self) -> Result<(), SinkError> {
        self.write("\n").await
    }

    async fn read_line(&self, cancel: &CancellationToken) -> Result<String, SinkError> {
        let mut lines = self.lines.lock().await;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SinkError::Cancelled),
            line = lines.next() => match line {
                Some(line) => Ok(line?),
                // End of input ends the conversation like Ctrl-C does
                None => {
                    cancel.cancel();
                    Err(SinkError::Cancelled)
                }
            },
        }
    }
}
