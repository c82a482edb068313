//! 上游不可用时的模拟回复（仅在 `chat.fallback_to_mock` 打开时使用）

use super::correlator::{ChatReply, ReplySource};

/// 关键词 → 预置回复，按顺序匹配第一个命中的规则
const CANNED_REPLIES: &[(&[&str], &str)] = &[
    (
        &["treasury", "balance", "portfolio"],
        "MoonDAO's treasury stands at $5.23M: 48% stablecoins, 32% ETH and 20% governance tokens. \
         Allocation is within the low-risk band.",
    ),
    (
        &["risk", "volatility", "exposure"],
        "Current risk score is low. Stablecoin share keeps drawdown exposure limited; \
         ETH concentration is the main volatility driver.",
    ),
    (
        &["yield", "apy", "farm", "liquidity"],
        "Idle stablecoins could earn 4-6% APY in blue-chip lending markets. \
         Consider a staged deployment to limit protocol risk.",
    ),
    (
        &["proposal", "vote", "governance"],
        "Proposal #1 \"Increase Stablecoin Allocation to 60%\" is active with 784 votes for \
         and 312 against; quorum is 1000.",
    ),
];

const DEFAULT_REPLY: &str =
    "I'm Obsidian, your DAO treasury assistant. Ask me about treasury health, risk, yield or governance.";

/// 按关键词挑选预置回复
pub fn mock_reply(message: &str, agent_id: &str) -> ChatReply {
    let lowered = message.to_lowercase();
    let text = CANNED_REPLIES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(_, reply)| *reply)
        .unwrap_or(DEFAULT_REPLY);

    ChatReply {
        text: text.to_string(),
        agent_id: agent_id.to_string(),
        source: ReplySource::Mock,
    }
}
