use std::time::Instant;

use chrono::Utc;
use rand::Rng;
use serde_json::{Value, json};

use crate::models::{NetworkStats, ValidatorBondsPage, ValidatorStats};

/// Chain height when the process started serving figures.
const BASE_BLOCK_HEIGHT: u64 = 4_812_000;
const TARGET_BLOCK_TIME_MS: u32 = 2_000;
const BASE_TOTAL_TRANSACTIONS: u64 = 96_400_000;

/// Content blocks and statistics for the site's pages.
///
/// Page copy is fixed. Statistics drift with uptime and a little jitter so
/// the dashboard looks alive; they are not read from a chain.
#[derive(Debug, Clone)]
pub struct ContentService {
    started: Instant,
}

impl Default for ContentService {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentService {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn home(&self) -> Value {
        json!({
            "hero": {
                "title": "A settlement layer built for everyday payments",
                "subtitle": "Fast finality, predictable fees and validator-secured consensus.",
                "primaryCta": { "label": "Read the whitepaper", "href": "/whitepaper" },
                "secondaryCta": { "label": "Become a validator", "href": "/validator-bonds" }
            },
            "features": [
                {
                    "id": "finality",
                    "title": "Two-second finality",
                    "description": "Blocks are final once produced. No confirmation waits."
                },
                {
                    "id": "fees",
                    "title": "Flat network fees",
                    "description": "Fees are quoted in advance and do not spike under load."
                },
                {
                    "id": "security",
                    "title": "Bonded validators",
                    "description": "Validators post bonds that are slashed for misbehaviour."
                }
            ]
        })
    }

    pub fn whitepaper(&self) -> Value {
        json!({
            "title": "Whitepaper",
            "version": "1.2",
            "updated": "2024-09-01",
            "download": { "href": "/static/whitepaper.pdf", "sizeBytes": 2_318_442 },
            "sections": [
                { "id": "abstract", "title": "Abstract" },
                { "id": "consensus", "title": "Consensus and finality" },
                { "id": "economics", "title": "Token economics" },
                { "id": "governance", "title": "On-chain governance" },
                { "id": "roadmap", "title": "Roadmap" }
            ]
        })
    }

    pub fn peopay(&self) -> Value {
        json!({
            "title": "PeoPay",
            "tagline": "Send money to anyone with a phone number.",
            "highlights": [
                { "title": "Instant transfers", "description": "Settled on-chain in seconds." },
                { "title": "Merchant payments", "description": "QR checkout with no card fees." },
                { "title": "Savings pools", "description": "Group savings backed by smart contracts." }
            ],
            "availability": { "platforms": ["ios", "android"], "regions": 14 }
        })
    }

    pub fn technology(&self) -> Value {
        json!({
            "title": "Technology",
            "stack": [
                {
                    "layer": "consensus",
                    "name": "Bonded proof of stake",
                    "description": "Byzantine fault tolerant rounds with deterministic finality."
                },
                {
                    "layer": "execution",
                    "name": "WASM runtime",
                    "description": "Contracts compile to WebAssembly and run in a metered sandbox."
                },
                {
                    "layer": "networking",
                    "name": "Gossip overlay",
                    "description": "Blocks and votes propagate over an authenticated peer mesh."
                }
            ],
            "specs": {
                "blockTimeMs": TARGET_BLOCK_TIME_MS,
                "maxValidators": 150,
                "unbondingPeriodDays": 21
            }
        })
    }

    pub fn network_stats(&self) -> NetworkStats {
        let mut rng = rand::rng();
        let elapsed_ms = self.started.elapsed().as_millis();
        let produced = u64::try_from(elapsed_ms / u128::from(TARGET_BLOCK_TIME_MS)).unwrap_or(0);
        let tps = rng.random_range(850..1_250);

        NetworkStats {
            block_height: BASE_BLOCK_HEIGHT + produced,
            transactions_per_second: tps,
            active_nodes: rng.random_range(410..440),
            average_block_time_ms: TARGET_BLOCK_TIME_MS + rng.random_range(0..120),
            total_transactions: BASE_TOTAL_TRANSACTIONS + produced * u64::from(tps) * 2,
            timestamp: Utc::now(),
        }
    }

    pub fn validator_stats(&self) -> ValidatorStats {
        let mut rng = rand::rng();
        let total_validators = rng.random_range(118..124);
        let offline = rng.random_range(0..4);

        ValidatorStats {
            total_validators,
            active_validators: total_validators - offline,
            total_bonded: 412_500_000 + rng.random_range(0..2_500_000),
            average_apy: round2(rng.random_range(7.8..8.6)),
            uptime_percentage: round2(rng.random_range(99.2..99.99)),
            timestamp: Utc::now(),
        }
    }

    pub fn validator_bonds(&self) -> ValidatorBondsPage {
        ValidatorBondsPage {
            content: json!({
                "title": "Validator bonds",
                "summary": "Validators lock a bond to join the active set and earn a share of fees.",
                "requirements": [
                    { "label": "Minimum bond", "value": "50,000 tokens" },
                    { "label": "Unbonding period", "value": "21 days" },
                    { "label": "Hardware", "value": "8 vCPU, 32 GB RAM, 1 TB NVMe" }
                ],
                "slashing": [
                    { "offence": "Double signing", "penalty": "5% of bond" },
                    { "offence": "Extended downtime", "penalty": "0.1% of bond" }
                ]
            }),
            stats: self.validator_stats(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_static_blocks_are_stable() {
        let service = ContentService::new();
        assert_eq!(service.home(), service.home());
        assert_eq!(service.technology()["specs"]["blockTimeMs"], 2_000);
        assert!(service.whitepaper()["sections"].as_array().unwrap().len() >= 3);
    }

    #[test]
    fn test_stats_within_bounds() {
        let service = ContentService::new();
        for _ in 0..50 {
            let network = service.network_stats();
            assert!(network.block_height >= BASE_BLOCK_HEIGHT);
            assert!((850..1_250).contains(&network.transactions_per_second));

            let validators = service.validator_stats();
            assert!(validators.active_validators <= validators.total_validators);
            assert!((7.8..=8.6).contains(&validators.average_apy));
        }
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let value = serde_json::to_value(ContentService::new().network_stats()).unwrap();
        assert!(value.get("blockHeight").is_some());
        assert!(value.get("transactionsPerSecond").is_some());
    }

    #[test]
    fn test_validator_bonds_combines_copy_and_stats() {
        let page = serde_json::to_value(ContentService::new().validator_bonds()).unwrap();
        assert_eq!(page["content"]["title"], "Validator bonds");
        assert!(page["stats"]["totalValidators"].as_u64().unwrap() >= 118);
    }
}
