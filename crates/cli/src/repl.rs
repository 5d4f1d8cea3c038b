use std::io;

use estate_chat::{ChatMessage, ChatSession, GatewayOutcome, Role, SessionUpdate, SubmitRejection};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const PROMPT: &str = "你> ";
const ASSISTANT_LABEL: &str = "助手> ";
const HELP_TEXT: &str = "输入问题开始对话；/reset 开始新会话，/quit 退出。\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command<'a> {
    Send(&'a str),
    Reset,
    Quit,
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        match line.trim() {
            "/quit" | "/exit" => Self::Quit,
            "/reset" | "/new" => Self::Reset,
            _ => Self::Send(line),
        }
    }
}

/// Line-oriented chat loop. Input is read only between replies, which keeps the
/// single outstanding request rule visible to the user.
pub async fn run<R, W>(mut session: ChatSession, input: R, mut output: W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output.write_all(HELP_TEXT.as_bytes()).await?;
    let gateway = session.gateway();
    output
        .write_all(format!("模型: {}\n\n", gateway.model_id()).as_bytes())
        .await?;
    render_transcript(&session, &mut output).await?;

    let mut lines = input.lines();
    loop {
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        match Command::parse(&line) {
            Command::Quit => break,
            Command::Reset => {
                session.reset();
                render_transcript(&session, &mut output).await?;
            }
            Command::Send(text) => match session.submit(text) {
                Ok(message_id) => {
                    let outcome = stream_reply(&mut session, &mut output).await?;
                    tracing::debug!(message_id = %message_id, ?outcome, "reply rendered");
                }
                Err(SubmitRejection::EmptyInput) => {}
                Err(SubmitRejection::Busy { active }) => {
                    tracing::warn!(active = %active, "input arrived while a reply is streaming");
                }
            },
        }
    }

    output.flush().await
}

async fn render_transcript<W>(session: &ChatSession, output: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for message in session.messages() {
        render_message(message, output).await?;
    }
    Ok(())
}

async fn render_message<W>(message: &ChatMessage, output: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let label = match message.role {
        Role::User => PROMPT,
        Role::Model => ASSISTANT_LABEL,
    };
    output
        .write_all(format!("{label}{}\n\n", message.text).as_bytes())
        .await
}

/// Writes fragments as they arrive until the reply finishes.
async fn stream_reply<W>(
    session: &mut ChatSession,
    output: &mut W,
) -> io::Result<Option<GatewayOutcome>>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(ASSISTANT_LABEL.as_bytes()).await?;

    while let Some(update) = session.next_update().await {
        match update {
            SessionUpdate::Fragment { text, .. } => {
                output.write_all(text.as_bytes()).await?;
                output.flush().await?;
            }
            SessionUpdate::Finished { outcome, .. } => {
                output.write_all(b"\n\n").await?;
                return Ok(Some(outcome));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use estate_chat::{MISSING_CREDENTIAL_TEXT, ModelGateway, WELCOME_TEXT};

    use super::*;

    #[test]
    fn commands_are_recognized_after_trimming() {
        assert_eq!(Command::parse(" /quit "), Command::Quit);
        assert_eq!(Command::parse("/new"), Command::Reset);
        assert_eq!(Command::parse("  北京  "), Command::Send("  北京  "));
    }

    #[tokio::test]
    async fn unconfigured_session_prints_configuration_error() {
        let session = ChatSession::new(ModelGateway::new(None));
        let input: &[u8] = "土地成交情况如何？\n/quit\n".as_bytes();
        let mut output = Vec::new();

        run(session, input, &mut output).await.unwrap();

        let printed = String::from_utf8(output).unwrap();
        assert!(printed.contains(WELCOME_TEXT));
        assert!(printed.contains(&format!("{ASSISTANT_LABEL}{MISSING_CREDENTIAL_TEXT}\n\n")));
    }

    #[tokio::test]
    async fn blank_lines_and_eof_end_cleanly() {
        let session = ChatSession::new(ModelGateway::new(None));
        let input: &[u8] = b"\n   \n";
        let mut output = Vec::new();

        run(session, input, &mut output).await.unwrap();

        let printed = String::from_utf8(output).unwrap();
        assert!(!printed.contains(MISSING_CREDENTIAL_TEXT));
        assert_eq!(printed.matches(PROMPT).count(), 3);
    }
}
