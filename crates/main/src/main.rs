//! 主应用程序入口
//!
//! - `amana-chat serve`（默认）：启动令牌签发服务（`/auth`、`/health`）
//! - `amana-chat chat <名字>`：以终端客户端加入配置中的频道

use std::env;

use application::ChatSession;
use config::AppConfig;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    tracing::info!(config = %config.sanitize(), "配置加载完成");

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("serve") => serve(&config).await,
        Some("chat") => {
            let name = args.get(1).map(String::as_str).unwrap_or_default();
            chat(&config, name).await
        }
        Some(other) => anyhow::bail!("未知命令: {other}（可用: serve, chat <名字>）"),
    }
}

async fn serve(config: &AppConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(config);
    if !state.token_issuer.is_configured() {
        tracing::warn!("APP_AUTH__API_KEY 未配置或格式错误，/auth 将返回 500");
    }

    let app = router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("令牌签发服务启动在 http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn chat(config: &AppConfig, name: &str) -> anyhow::Result<()> {
    let session = infrastructure::chat_session(config)?;
    let input = BufReader::new(tokio::io::stdin());
    run_chat(&session, name, input).await
}

/// 加入频道并转发输入行；无论循环以何种方式结束都会拆除会话
async fn run_chat<R>(session: &ChatSession, name: &str, input: R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    session.join(name).await?;
    let client_id = session
        .client_id()
        .ok_or_else(|| anyhow::anyhow!("会话未持有客户端标识"))?;

    println!(
        "已加入 {}，在线: {}",
        session.channel_name(),
        session.presence().client_ids().join(", ")
    );

    let printer = tokio::spawn(print_updates(session.clone(), client_id));
    let result = chat_loop(session, input).await;

    printer.abort();
    session.teardown().await;
    result
}

async fn chat_loop<R>(session: &ChatSession, input: R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => return Ok(()),
                Some(line) => {
                    if !session.send(&line).await? {
                        println!("(未发送：连接未就绪或内容无效)");
                    }
                }
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn print_updates(session: ChatSession, client_id: domain::ClientId) {
    let mut messages = session.subscribe_messages();
    let mut presence = session.presence_watch();
    let mut connection = session.connection_watch();

    loop {
        tokio::select! {
            received = messages.recv() => match received {
                Ok(message) => {
                    let marker = if message.is_own(&client_id) { "*" } else { " " };
                    println!("{marker}[{}] {}", message.sender_id, message.text);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "消息输出落后，已跳过部分消息");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = presence.changed() => {
                if changed.is_err() {
                    break;
                }
                let members = presence.borrow_and_update().client_ids();
                println!("-- 在线 ({}): {}", members.len(), members.join(", "));
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                println!("-- 连接状态: {state}");
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "监听退出信号失败");
        return;
    }
    tracing::info!("收到退出信号，正在关闭服务");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use application::{FnAuthBridge, MemoryBackbone, SessionDependencies, SessionState, SystemClock};
    use domain::{Capability, ClientId, TokenRequest};

    use super::*;

    fn session(backbone: &MemoryBackbone) -> ChatSession {
        let auth = FnAuthBridge::new(|client_id: ClientId| async move {
            Ok(TokenRequest {
                key_name: "test.key".into(),
                client_id: Some(client_id.to_string()),
                capability: Capability::for_namespace("amana-chat"),
                timestamp: 0,
                nonce: "nonce".into(),
                ttl: 60_000,
                mac: "mac".into(),
            })
        });
        ChatSession::new(SessionDependencies {
            transport_factory: Arc::new(backbone.factory()),
            auth: Arc::new(auth),
            clock: Arc::new(SystemClock),
            channel: "amana-chat:public".parse().unwrap(),
            dedupe_message_ids: false,
        })
    }

    #[tokio::test]
    async fn test_quit_leaves_channel() {
        let backbone = MemoryBackbone::new();
        let alice = session(&backbone);

        run_chat(&alice, "Alice", &b"hello\n/quit\n"[..])
            .await
            .unwrap();

        assert_eq!(alice.state(), SessionState::Idle);
        let channel = alice.channel_name().clone();
        assert!(backbone.members(&channel).is_empty());
        assert!(backbone.operations().contains(&"Alice:close".to_string()));
    }

    #[tokio::test]
    async fn test_input_error_still_tears_down() {
        let backbone = MemoryBackbone::new();
        let alice = session(&backbone);

        // 非 UTF-8 输入让读取行时出错
        let result = run_chat(&alice, "Alice", &b"hello\n\xff\xfe\n"[..]).await;

        assert!(result.is_err());
        assert_eq!(alice.state(), SessionState::Idle);
        let channel = alice.channel_name().clone();
        assert!(backbone.members(&channel).is_empty());
        assert_eq!(backbone.subscriber_count(&channel), 0);
        assert!(backbone.operations().contains(&"Alice:presence.leave".to_string()));
    }
}
