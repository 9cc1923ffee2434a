use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc};

use webpilot::Operator;

/// Reads operator input from the terminal. Lines typed while the agent is
/// busy are delivered as interjections at the start of the next turn.
pub struct StdinOperator {
    lines: Mutex<mpsc::Receiver<String>>,
}

impl StdinOperator {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<String>(8);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        Self {
            lines: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl Operator for StdinOperator {
    async fn answer(&self, question: &str) -> Result<String> {
        eprintln!("\n[Agent asks] {question}");
        eprint!("> ");
        self.lines
            .lock()
            .await
            .recv()
            .await
            .context("terminal input closed before an answer arrived")
    }

    async fn interjection(&self) -> Option<String> {
        self.lines.lock().await.try_recv().ok()
    }
}
