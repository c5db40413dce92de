//! JSON-RPC transport and the typed arena reader.
//!
//! Plain `eth_call`/balance/receipt plumbing over reqwest with explicit
//! timeouts. RPC error payloads keep their `data` field in the message so
//! revert decoding can walk the cause chain.

use crate::chain::abi::{IArena, IERC20};
use crate::chain::{ChainReader, EpochInfo, EpochPhase, OnChainPortfolio};
use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolCall;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const RECEIPT_POLL: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Minimal receipt view: status plus logs for event decoding.
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub status: bool,
    pub logs: Vec<ReceiptLog>,
}

#[derive(Debug, Clone)]
pub struct ReceiptLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
}

impl RpcClient {
    pub fn new(url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(READ_TIMEOUT)
            .build()
            .context("failed to build rpc http client")?;
        Ok(Self { http, url })
    }

    pub async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("rpc send {method}"))?;
        let parsed: JsonRpcResponse = resp
            .json()
            .await
            .with_context(|| format!("rpc json {method}"))?;

        if let Some(err) = parsed.error {
            // Keep `data` inline: it carries revert bytes for decoding.
            let data = err
                .data
                .map(|d| format!(" data={}", d.to_string().trim_matches('"')))
                .unwrap_or_default();
            return Err(anyhow!("rpc error {}: {}{}", err.code, err.message, data));
        }
        parsed
            .result
            .ok_or_else(|| anyhow!("rpc {method}: empty result"))
    }

    pub async fn call(&self, to: Address, data: &[u8]) -> Result<Vec<u8>> {
        self.call_from(None, to, data).await
    }

    pub async fn call_from(
        &self,
        from: Option<Address>,
        to: Address,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let mut obj = serde_json::json!({
            "to": format!("{to:#x}"),
            "data": format!("0x{}", hex::encode(data)),
        });
        if let Some(from) = from {
            obj["from"] = serde_json::json!(format!("{from:#x}"));
        }
        let result = self
            .request("eth_call", serde_json::json!([obj, "latest"]))
            .await?;
        decode_hex_value(&result)
    }

    pub async fn get_balance(&self, addr: Address) -> Result<U256> {
        let result = self
            .request(
                "eth_getBalance",
                serde_json::json!([format!("{addr:#x}"), "latest"]),
            )
            .await?;
        parse_u256(&result)
    }

    pub async fn transaction_count(&self, addr: Address) -> Result<u64> {
        let result = self
            .request(
                "eth_getTransactionCount",
                serde_json::json!([format!("{addr:#x}"), "pending"]),
            )
            .await?;
        Ok(parse_u256(&result)?.saturating_to::<u64>())
    }

    pub async fn gas_price(&self) -> Result<u128> {
        let result = self.request("eth_gasPrice", serde_json::json!([])).await?;
        Ok(parse_u256(&result)?.saturating_to::<u128>())
    }

    pub async fn max_priority_fee(&self) -> Result<u128> {
        match self
            .request("eth_maxPriorityFeePerGas", serde_json::json!([]))
            .await
        {
            Ok(v) => Ok(parse_u256(&v)?.saturating_to::<u128>()),
            // Not every node exposes it; 1 gwei floor.
            Err(_) => Ok(1_000_000_000),
        }
    }

    pub async fn estimate_gas(&self, from: Address, to: Address, data: &[u8]) -> Result<u64> {
        let obj = serde_json::json!({
            "from": format!("{from:#x}"),
            "to": format!("{to:#x}"),
            "data": format!("0x{}", hex::encode(data)),
        });
        let result = self
            .request("eth_estimateGas", serde_json::json!([obj]))
            .await?;
        Ok(parse_u256(&result)?.saturating_to::<u64>())
    }

    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256> {
        let result = self
            .request(
                "eth_sendRawTransaction",
                serde_json::json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        parse_b256(&result)
    }

    pub async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>> {
        let result = self
            .request(
                "eth_getTransactionReceipt",
                serde_json::json!([format!("{tx_hash:#x}")]),
            )
            .await;
        let value = match result {
            Ok(v) => v,
            Err(e) => return Err(e),
        };
        if value.is_null() {
            return Ok(None);
        }

        let status = value
            .get("status")
            .and_then(|s| s.as_str())
            .map(|s| s == "0x1")
            .unwrap_or(false);
        let mut logs = Vec::new();
        if let Some(raw_logs) = value.get("logs").and_then(|l| l.as_array()) {
            for log in raw_logs {
                let address = log
                    .get("address")
                    .and_then(|a| a.as_str())
                    .and_then(|a| a.parse::<Address>().ok());
                let topics: Vec<B256> = log
                    .get("topics")
                    .and_then(|t| t.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|t| t.as_str())
                            .filter_map(|t| t.parse::<B256>().ok())
                            .collect()
                    })
                    .unwrap_or_default();
                let data = log
                    .get("data")
                    .and_then(|d| d.as_str())
                    .and_then(|d| hex::decode(d.trim_start_matches("0x")).ok())
                    .unwrap_or_default();
                if let Some(address) = address {
                    logs.push(ReceiptLog {
                        address,
                        topics,
                        data,
                    });
                }
            }
        }

        Ok(Some(TxReceipt {
            tx_hash,
            status,
            logs,
        }))
    }

    /// Poll for a receipt until `timeout` elapses.
    pub async fn wait_for_receipt(&self, tx_hash: B256, timeout: Duration) -> Result<TxReceipt> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(receipt) = self.receipt(tx_hash).await? {
                return Ok(receipt);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("receipt timeout for {tx_hash:#x}"));
            }
            sleep(RECEIPT_POLL).await;
        }
    }
}

fn decode_hex_value(v: &serde_json::Value) -> Result<Vec<u8>> {
    let s = v.as_str().ok_or_else(|| anyhow!("non-string rpc result"))?;
    hex::decode(s.trim_start_matches("0x")).context("rpc hex decode")
}

fn parse_u256(v: &serde_json::Value) -> Result<U256> {
    let s = v.as_str().ok_or_else(|| anyhow!("non-string rpc result"))?;
    U256::from_str_radix(s.trim_start_matches("0x"), 16).context("rpc u256 parse")
}

fn parse_b256(v: &serde_json::Value) -> Result<B256> {
    let s = v.as_str().ok_or_else(|| anyhow!("non-string rpc result"))?;
    s.parse::<B256>().context("rpc b256 parse")
}

/// Typed reads against the arena and MOLTI contracts.
pub struct ArenaReader {
    rpc: RpcClient,
    arena: Address,
    molti: Address,
}

impl ArenaReader {
    pub fn new(rpc: RpcClient, arena: Address, molti: Address) -> Self {
        Self { rpc, arena, molti }
    }
}

#[async_trait]
impl ChainReader for ArenaReader {
    async fn molti_balance(&self, owner: Address) -> Result<U256> {
        let call = IERC20::balanceOfCall { owner };
        let out = self.rpc.call(self.molti, &call.abi_encode()).await?;
        let balance = IERC20::balanceOfCall::abi_decode_returns(&out)
            .context("balanceOf decode")?;
        Ok(balance)
    }

    async fn native_balance(&self, owner: Address) -> Result<U256> {
        self.rpc.get_balance(owner).await
    }

    async fn molti_allowance(&self, owner: Address) -> Result<U256> {
        let call = IERC20::allowanceCall {
            owner,
            spender: self.arena,
        };
        let out = self.rpc.call(self.molti, &call.abi_encode()).await?;
        let remaining = IERC20::allowanceCall::abi_decode_returns(&out)
            .context("allowance decode")?;
        Ok(remaining)
    }

    async fn portfolio(&self, agent_id: u64, arena_id: u64) -> Result<OnChainPortfolio> {
        let call = IArena::getPortfolioCall {
            agentId: U256::from(agent_id),
            arenaId: U256::from(arena_id),
        };
        let out = self.rpc.call(self.arena, &call.abi_encode()).await?;
        let ret = IArena::getPortfolioCall::abi_decode_returns(&out)
            .context("getPortfolio decode")?;
        Ok(OnChainPortfolio {
            molti_locked: ret.moltiLocked,
            token_units: ret.tokenUnits,
        })
    }

    async fn epoch_phase(&self, arena_id: u64, now_sec: i64) -> Result<EpochPhase> {
        let call = IArena::getEpochPhaseCall {
            arenaId: U256::from(arena_id),
            nowSec: now_sec.max(0) as u64,
        };
        let out = self.rpc.call(self.arena, &call.abi_encode()).await?;
        let ret = IArena::getEpochPhaseCall::abi_decode_returns(&out)
            .context("getEpochPhase decode")?;
        Ok(EpochPhase {
            to_end: ret.hasToEnd.then(|| ret.toEnd.saturating_to::<u64>()),
            active: ret.hasActive.then(|| ret.active.saturating_to::<u64>()),
        })
    }

    async fn next_epoch_id(&self, arena_id: u64) -> Result<u64> {
        let call = IArena::nextEpochIdCall {
            arenaId: U256::from(arena_id),
        };
        let out = self.rpc.call(self.arena, &call.abi_encode()).await?;
        let id = IArena::nextEpochIdCall::abi_decode_returns(&out)
            .context("nextEpochId decode")?;
        Ok(id.saturating_to::<u64>())
    }

    async fn epoch_info(&self, arena_id: u64, epoch_id: u64) -> Result<EpochInfo> {
        let call = IArena::epochsCall {
            arenaId: U256::from(arena_id),
            epochId: U256::from(epoch_id),
        };
        let out = self.rpc.call(self.arena, &call.abi_encode()).await?;
        let ret = IArena::epochsCall::abi_decode_returns(&out).context("epochs decode")?;
        Ok(EpochInfo {
            start_at: ret.startTime as i64,
            end_at: ret.endTime as i64,
            ended: ret.ended,
            reward_pool: ret.rewardPool,
        })
    }

    async fn registered_agents(&self, arena_id: u64) -> Result<Vec<u64>> {
        let call = IArena::registeredAgentsCall {
            arenaId: U256::from(arena_id),
        };
        let out = self.rpc.call(self.arena, &call.abi_encode()).await?;
        let ids = IArena::registeredAgentsCall::abi_decode_returns(&out)
            .context("registeredAgents decode")?;
        Ok(ids.into_iter().map(|id| id.saturating_to::<u64>()).collect())
    }

    async fn is_epoch_registered(
        &self,
        arena_id: u64,
        epoch_id: u64,
        agent_id: u64,
    ) -> Result<bool> {
        let call = IArena::isEpochRegisteredCall {
            arenaId: U256::from(arena_id),
            epochId: U256::from(epoch_id),
            agentId: U256::from(agent_id),
        };
        let out = self.rpc.call(self.arena, &call.abi_encode()).await?;
        IArena::isEpochRegisteredCall::abi_decode_returns(&out).context("isEpochRegistered decode")
    }

    async fn pending_reward(&self, arena_id: u64, epoch_id: u64, agent_id: u64) -> Result<U256> {
        let call = IArena::getPendingRewardCall {
            arenaId: U256::from(arena_id),
            epochId: U256::from(epoch_id),
            agentId: U256::from(agent_id),
        };
        let out = self.rpc.call(self.arena, &call.abi_encode()).await?;
        IArena::getPendingRewardCall::abi_decode_returns(&out).context("getPendingReward decode")
    }
}
