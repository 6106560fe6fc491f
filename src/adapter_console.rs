use onebot_bridge::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "命令:
  in <domain> <conv> <actor> <msg> [text]   模拟入站事件 (domain: group / guild / guild_private / group_private)
  send <group_id|-> <user_id|-> <text> [echo]   模拟 OneBot 发送调用
  resolve <vid>   查看虚拟 ID 的原始 ID 与已知类型
  quit   退出";

/// 把请求打印到终端的发送端
#[derive(Default)]
pub struct ConsoleTransport {
    msg_seq: AtomicU64,
}

#[async_trait]
impl OutboundTransport for ConsoleTransport {
    type Payload = String;

    async fn send(&self, request: &OutboundRequest<String>) -> Result<Receipt, TransportError> {
        let seq = self.msg_seq.fetch_add(1, Ordering::Relaxed);
        println!(
            "--> [{}] {} reply_to={} msg_seq={} verified={} : {}",
            request.domain,
            request.conversation_id,
            request.reply_to.as_deref().unwrap_or("-"),
            request.msg_seq.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            request.verified,
            request.payload
        );
        Ok(Receipt {
            message_id: format!("reply_{}", seq),
        })
    }
}

#[derive(Serialize)]
struct ConsoleCall<'a> {
    action: &'a str,
    params: ConsoleParams<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    echo: Option<&'a str>,
}

#[derive(Serialize)]
struct ConsoleParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    message: &'a str,
}

fn dash_to_none(s: &str) -> Option<&str> {
    if s == "-" { None } else { Some(s) }
}

/// 读取标准输入直到 `quit` 或输入结束
pub async fn run(gateway: Arc<Gateway<ConsoleTransport>>) -> BridgeResult<()> {
    println!("{}", HELP);

    let mut reader = BufReader::new(tokio::io::stdin()).lines();
    let mut sequence = 0u64;

    loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(target: "Console", "读取输入错误: {}", e);
                break;
            }
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&cmd, args)) = parts.split_first() else {
            continue;
        };

        match cmd {
            "quit" | "/exit" => break,
            "in" if args.len() >= 4 => {
                let domain = match args[0].parse::<Domain>() {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(target: "Console", "{}", e);
                        continue;
                    }
                };
                sequence += 1;
                let event = InboundEvent {
                    app_id: gateway.app_id().to_string(),
                    sequence,
                    domain,
                    conversation_id: args[1].to_string(),
                    actor_id: args[2].to_string(),
                    message_id: args[3].to_string(),
                    event_id: None,
                    guild_id: None,
                    content: args[4..].join(" "),
                };
                match gateway.on_inbound(event).await {
                    Ok(id) => println!(
                        "<-- 会话 {} 成员 {} 消息 {} echo={} 补发 {}",
                        id.conversation_vid, id.actor_vid, id.message_vid, id.echo, id.flushed
                    ),
                    Err(e) => warn!(target: "Console", "入站处理失败: {}", e),
                }
            }
            "send" if args.len() >= 3 => {
                let call = ConsoleCall {
                    action: "send_msg",
                    params: ConsoleParams {
                        group_id: dash_to_none(args[0]),
                        user_id: dash_to_none(args[1]),
                        message: args[2],
                    },
                    echo: args.get(3).copied(),
                };
                let decoded = simd_json::to_vec(&call)
                    .map_err(BridgeError::from)
                    .and_then(|mut frame| decode_call::<String>(&mut frame));
                let call = match decoded {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(target: "Console", "{}", e);
                        continue;
                    }
                };
                let echo = call.echo.clone();
                match gateway.send(call).await {
                    Ok(outcome) => println!(
                        "ack echo={} {:?}",
                        echo.map(|e| e.to_string()).unwrap_or_default(),
                        outcome
                    ),
                    Err(e) => println!("failed: {}", e),
                }
            }
            "resolve" if args.len() == 1 => {
                let Ok(vid) = args[0].parse::<i64>() else {
                    warn!(target: "Console", "不是数字: {}", args[0]);
                    continue;
                };
                let raw = gateway.devirtualize(vid).await;
                let domain = gateway.known_domain(Some(vid), None).await;
                println!(
                    "{} -> {} ({})",
                    vid,
                    raw.as_deref().unwrap_or("未知"),
                    domain.map(|d| d.to_string()).unwrap_or_else(|| "类型未知".into())
                );
            }
            _ => println!("{}", HELP),
        }
    }

    Ok(())
}
