use super::{ConversationChannel, SessionContext};
use crate::stream::StreamEvent;
use async_trait::async_trait;
use resumo_core::{ResumoError, ResumoResult};
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Placeholder in `args` replaced by the session identifier.
pub const SESSION_ID_PLACEHOLDER: &str = "{session_id}";

/// External command channel.
///
/// Spawns `program args...` once per turn, writes the turn content to its
/// stdin and streams stdout back one line per chunk, terminators kept, so
/// the concatenated chunks equal the program's output. A zero exit status ends the
/// turn; anything else fails it with the captured stderr.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    program: String,
    args: Vec<String>,
}

impl CommandChannel {
    /// Channel running `program` with `args`; see [`SESSION_ID_PLACEHOLDER`].
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn render_args(&self, session_id: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(SESSION_ID_PLACEHOLDER, session_id))
            .collect()
    }
}

fn prompt_bytes(content: &Value) -> ResumoResult<Vec<u8>> {
    match content {
        Value::String(text) => Ok(text.clone().into_bytes()),
        other => Ok(serde_json::to_vec(other)?),
    }
}

#[async_trait]
impl ConversationChannel for CommandChannel {
    fn name(&self) -> &str {
        &self.program
    }

    async fn send(
        &self,
        ctx: SessionContext<'_>,
        content: &Value,
    ) -> ResumoResult<mpsc::Receiver<StreamEvent>> {
        let prompt = prompt_bytes(content)?;
        let args = self.render_args(ctx.session_id.as_str());

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            session_id = %ctx.session_id,
            program = %self.program,
            resumed = ctx.resumed,
            prompt_len = prompt.len(),
            "Command channel: spawning"
        );

        let mut child = cmd.spawn().map_err(|e| {
            ResumoError::Channel(format!("Failed to run '{}': {e}", self.program))
        })?;

        let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ResumoError::Channel("child stdio was not captured".into()));
        };

        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        tokio::spawn(async move {
            // stdin is written concurrently with reading stdout so a chatty
            // child cannot deadlock on a full pipe.
            let writer = tokio::spawn(async move {
                let _ = stdin.write_all(&prompt).await;
                let _ = stdin.shutdown().await;
            });
            let stderr_reader = tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            });

            // Chunks keep their terminators so the reply is reassembled
            // byte for byte, `\r\n` included.
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf).into_owned();
                        if tx.send(StreamEvent::TextDelta { text }).await.is_err() {
                            // Receiver dropped: the caller cancelled the turn.
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                message: format!("reading stdout: {e}"),
                            })
                            .await;
                        return;
                    }
                }
            }

            let _ = writer.await;
            let stderr_text = stderr_reader.await.unwrap_or_default();
            let event = match child.wait().await {
                Ok(status) if status.success() => StreamEvent::Done,
                Ok(status) => StreamEvent::Error {
                    message: format!(
                        "command exited with {}: {}",
                        status.code().unwrap_or(-1),
                        stderr_text.trim()
                    ),
                },
                Err(e) => StreamEvent::Error {
                    message: format!("waiting for command: {e}"),
                },
            };
            let _ = tx.send(event).await;
        });

        Ok(rx)
    }
}
