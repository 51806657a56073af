use super::{ConversationChannel, SessionContext};
use crate::stream::StreamEvent;
use async_trait::async_trait;
use resumo_core::ResumoResult;
use serde_json::Value;
use tokio::sync::mpsc;

/// Channel that answers every turn with its own content.
///
/// Text is streamed back one word at a time; structured content comes back
/// as a single block. Useful for trying out persistence without a backend.
#[derive(Debug, Default, Clone)]
pub struct EchoChannel;

impl EchoChannel {
    /// A new echo channel.
    pub fn new() -> Self {
        Self
    }
}

fn chunks(content: &Value) -> Vec<StreamEvent> {
    match content {
        Value::String(text) => text
            .split_inclusive(char::is_whitespace)
            .map(|word| StreamEvent::TextDelta {
                text: word.to_string(),
            })
            .collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| StreamEvent::Block {
                content: item.clone(),
            })
            .collect(),
        other => vec![StreamEvent::Block {
            content: other.clone(),
        }],
    }
}

#[async_trait]
impl ConversationChannel for EchoChannel {
    fn name(&self) -> &str {
        "echo"
    }

    async fn send(
        &self,
        ctx: SessionContext<'_>,
        content: &Value,
    ) -> ResumoResult<mpsc::Receiver<StreamEvent>> {
        let events = chunks(content);
        tracing::debug!(
            session_id = %ctx.session_id,
            chunks = events.len(),
            "Echo: replaying turn"
        );

        let (tx, rx) = mpsc::channel::<StreamEvent>(16);
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamEvent::Done).await;
        });
        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use resumo_core::SessionId;
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn collect(content: Value) -> Vec<StreamEvent> {
        let id = SessionId::parse("echo-test").unwrap();
        let metadata = BTreeMap::new();
        let ctx = SessionContext {
            session_id: &id,
            resumed: false,
            history: &[],
            metadata: &metadata,
        };
        let mut rx = EchoChannel::new().send(ctx, &content).await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_text_is_streamed_word_by_word() {
        let events = collect(json!("hello there world")).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta { text: "hello ".into() },
                StreamEvent::TextDelta { text: "there ".into() },
                StreamEvent::TextDelta { text: "world".into() },
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_structured_content_comes_back_as_blocks() {
        let events = collect(json!([{"type": "image", "id": 1}])).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Block {
                    content: json!({"type": "image", "id": 1})
                },
                StreamEvent::Done,
            ]
        );
    }
}
