//! 仪表盘使用的静态演示数据（DAO、市场 agent、提案、金库、情报）

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioAllocation {
    pub stablecoins: u32,
    pub eth: u32,
    pub governance_tokens: u32,
    pub other: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dao {
    pub id: String,
    pub name: String,
    pub address: String,
    pub treasury_value: u64,
    pub treasury_value_change_24h: f64,
    pub member_count: u32,
    pub risk_score: String,
    pub portfolio_allocation: PortfolioAllocation,
    pub performance_rank: u32,
    #[serde(rename = "totalDAOs")]
    pub total_daos: u32,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingModel {
    Performance,
    Fixed,
    Hybrid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
    pub model: PricingModel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_fee: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_fee: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reputation {
    pub score: u32,
    pub reviews: u32,
    pub badges: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Available,
    Busy,
    Offline,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::Busy => "busy",
            Availability::Offline => "offline",
        }
    }
}

/// 市场中的分析 agent（与上游 Eliza agent 无关）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketAgent {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub specializations: Vec<String>,
    pub rating: f64,
    pub total_clients: u32,
    pub success_rate: u32,
    pub pricing: Pricing,
    pub reputation: Reputation,
    pub availability: Availability,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub votes_for: u32,
    pub votes_against: u32,
    pub votes_abstain: u32,
    pub quorum: u32,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenHolding {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub balance: f64,
    pub value: f64,
    pub price: f64,
    pub change_24h: f64,
    pub allocation: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub volatility: f64,
    pub max_drawdown: f64,
    pub win_rate: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Treasury {
    pub total_value: u64,
    pub tokens: Vec<TokenHolding>,
    pub transactions: Vec<Transaction>,
    pub strategies: Vec<serde_json::Value>,
    pub performance_metrics: PerformanceMetrics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub from: String,
    pub to: String,
    pub amount: f64,
    pub token: String,
    pub timestamp: DateTime<Utc>,
    pub tx_hash: String,
    pub gas_used: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub id: String,
    pub title: String,
    pub category: String,
    pub severity: String,
    pub description: String,
    #[serde(rename = "affectedDAOs")]
    pub affected_daos: u32,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub confidence: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Benchmark {
    pub metric: String,
    pub your_value: f64,
    pub peer_average: f64,
    pub top_quartile: f64,
    pub bottom_quartile: f64,
    pub trend: String,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// 内存中的演示数据
#[derive(Debug, Clone)]
pub struct Fixtures {
    pub daos: Vec<Dao>,
    pub agents: Vec<MarketAgent>,
    pub proposals: Vec<Proposal>,
}

impl Default for Fixtures {
    fn default() -> Self {
        Self::demo()
    }
}

impl Fixtures {
    pub fn demo() -> Self {
        let now = Utc::now();
        Self {
            daos: vec![Dao {
                id: "moondao".into(),
                name: "MoonDAO".into(),
                address: "0x742d35Cc6634C0532925a3b844Bc9e7595f8b9A0".into(),
                treasury_value: 5_230_000,
                treasury_value_change_24h: 3.45,
                member_count: 1250,
                risk_score: "low".into(),
                portfolio_allocation: PortfolioAllocation {
                    stablecoins: 48,
                    eth: 32,
                    governance_tokens: 20,
                    other: 0,
                },
                performance_rank: 23,
                total_daos: 150,
                last_activity: now,
            }],
            agents: vec![
                MarketAgent {
                    id: "1".into(),
                    name: "RiskGuard Pro".into(),
                    kind: "Risk Analysis".into(),
                    description: "Advanced risk analysis using machine learning to identify potential threats and opportunities.".into(),
                    specializations: strings(&["Portfolio Risk", "Market Volatility", "Correlation Analysis"]),
                    rating: 4.8,
                    total_clients: 89,
                    success_rate: 94,
                    pricing: Pricing {
                        model: PricingModel::Performance,
                        base_fee: None,
                        performance_fee: Some(2.5),
                    },
                    reputation: Reputation {
                        score: 95,
                        reviews: 156,
                        badges: strings(&["Top Performer", "Verified Expert"]),
                    },
                    availability: Availability::Available,
                },
                MarketAgent {
                    id: "2".into(),
                    name: "YieldMaximizer AI".into(),
                    kind: "Yield Optimization".into(),
                    description: "Sophisticated yield farming strategies across multiple protocols.".into(),
                    specializations: strings(&["DeFi Yields", "Liquidity Mining", "Multi-chain"]),
                    rating: 4.9,
                    total_clients: 124,
                    success_rate: 91,
                    pricing: Pricing {
                        model: PricingModel::Hybrid,
                        base_fee: Some(500.0),
                        performance_fee: Some(1.5),
                    },
                    reputation: Reputation {
                        score: 98,
                        reviews: 203,
                        badges: strings(&["Yield Master", "Innovation Award"]),
                    },
                    availability: Availability::Available,
                },
            ],
            proposals: vec![Proposal {
                id: "1".into(),
                title: "Increase Stablecoin Allocation to 60%".into(),
                description: "Proposal to increase stablecoin allocation for risk management.".into(),
                kind: "treasury".into(),
                status: "active".into(),
                votes_for: 784,
                votes_against: 312,
                votes_abstain: 89,
                quorum: 1000,
                deadline: now + Duration::hours(48),
            }],
        }
    }

    pub fn dao(&self, id: &str) -> Option<&Dao> {
        self.daos.iter().find(|d| d.id == id)
    }

    pub fn agent(&self, id: &str) -> Option<&MarketAgent> {
        self.agents.iter().find(|a| a.id == id)
    }
}

pub fn treasury() -> Treasury {
    let token = |id: &str, symbol: &str, name: &str, balance: f64, value: f64, price: f64, change: f64, allocation: u32| {
        TokenHolding {
            id: id.into(),
            symbol: symbol.into(),
            name: name.into(),
            balance,
            value,
            price,
            change_24h: change,
            allocation,
        }
    };
    Treasury {
        total_value: 5_230_000,
        tokens: vec![
            token("1", "USDC", "USD Coin", 2_510_400.0, 2_510_400.0, 1.0, 0.0, 48),
            token("2", "ETH", "Ethereum", 850.0, 1_673_600.0, 1969.0, 2.3, 32),
            token("3", "MOON", "MoonDAO", 1_046_000.0, 1_046_000.0, 1.0, -1.2, 20),
        ],
        transactions: Vec::new(),
        strategies: Vec::new(),
        performance_metrics: PerformanceMetrics {
            total_return: 12.3,
            sharpe_ratio: 1.8,
            volatility: 18.5,
            max_drawdown: -12.3,
            win_rate: 68,
        },
    }
}

pub fn transactions() -> Vec<Transaction> {
    vec![Transaction {
        id: "1".into(),
        kind: "receive".into(),
        status: "confirmed".into(),
        from: "0x742d...b9A0".into(),
        to: "0x123...456".into(),
        amount: 10_000.0,
        token: "USDC".into(),
        timestamp: Utc::now() - Duration::hours(1),
        tx_hash: "0xabc...def".into(),
        gas_used: 21_000,
    }]
}

pub fn insights() -> Vec<Insight> {
    vec![Insight {
        id: "1".into(),
        title: "Layer 2 Migration Trend Accelerating".into(),
        category: "trend".into(),
        severity: "info".into(),
        description: "Based on anonymized data from 89 DAOs, Layer 2 adoption has increased by 35% in the past month.".into(),
        affected_daos: 89,
        timestamp: Utc::now(),
        source: "collective".into(),
        confidence: 92,
    }]
}

pub fn benchmarks() -> Vec<Benchmark> {
    let row = |metric: &str, yours: f64, avg: f64, top: f64, bottom: f64, trend: &str| Benchmark {
        metric: metric.into(),
        your_value: yours,
        peer_average: avg,
        top_quartile: top,
        bottom_quartile: bottom,
        trend: trend.into(),
    };
    vec![
        row("Treasury Growth", 12.3, 8.7, 15.2, 3.4, "up"),
        row("Risk Score", 82.0, 75.0, 88.0, 65.0, "stable"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dao_serializes_dashboard_shape() {
        let fixtures = Fixtures::demo();
        let dao = serde_json::to_value(fixtures.dao("moondao").unwrap()).unwrap();
        assert_eq!(dao["treasuryValue"], 5_230_000);
        assert_eq!(dao["totalDAOs"], 150);
        assert_eq!(dao["portfolioAllocation"]["governanceTokens"], 20);
        assert!(fixtures.dao("nope").is_none());
    }

    #[test]
    fn test_agent_pricing_omits_missing_fees() {
        let fixtures = Fixtures::demo();
        let agent = serde_json::to_value(fixtures.agent("1").unwrap()).unwrap();
        assert_eq!(agent["type"], "Risk Analysis");
        assert_eq!(agent["pricing"]["model"], "performance");
        assert!(agent["pricing"].get("baseFee").is_none());
    }

    #[test]
    fn test_treasury_allocations_sum_to_100() {
        let total: u32 = treasury().tokens.iter().map(|t| t.allocation).sum();
        assert_eq!(total, 100);
    }
}
