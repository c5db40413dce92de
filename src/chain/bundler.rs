//! Account-abstraction path: agent trades as user operations.
//!
//! Each agent's smart account executes arena calls through the bundler. The
//! session key that signs a user operation is stored encrypted; unlocking it
//! is a capability behind `KeyVault` (the production vault defers to the
//! wallet service, tests use a static vault).

use crate::chain::abi::{to_wei18, IArena, IEntryPoint, IERC20, ISmartAccount};
use crate::chain::rpc::RpcClient;
use crate::chain::{AgentWallet, ExecuteTradeParams, TradeSubmitter};
use crate::retry::{retry, RetryOpts};
use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol_types::SolCall;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

const USEROP_RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);
const USEROP_RECEIPT_POLL: Duration = Duration::from_secs(2);

/// Capability: unlock an encrypted session key into a signer.
#[async_trait]
pub trait KeyVault: Send + Sync {
    async fn unlock(&self, encrypted: &str) -> Result<PrivateKeySigner>;
}

/// Dev/test vault: the stored blob is the hex key itself.
pub struct StaticKeyVault;

#[async_trait]
impl KeyVault for StaticKeyVault {
    async fn unlock(&self, encrypted: &str) -> Result<PrivateKeySigner> {
        encrypted.trim().parse().context("static key parse")
    }
}

/// Production vault: the wallet service holds the decryption material.
pub struct WalletServiceVault {
    http: reqwest::Client,
    url: String,
}

impl WalletServiceVault {
    pub fn new(url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("wallet service http client")?;
        Ok(Self { http, url })
    }
}

#[derive(Debug, Deserialize)]
struct UnlockResponse {
    #[serde(rename = "privateKey")]
    private_key: String,
}

#[async_trait]
impl KeyVault for WalletServiceVault {
    async fn unlock(&self, encrypted: &str) -> Result<PrivateKeySigner> {
        let resp = self
            .http
            .post(format!("{}/v1/keys/unlock", self.url.trim_end_matches('/')))
            .json(&serde_json::json!({ "encryptedKey": encrypted }))
            .send()
            .await
            .context("wallet service unlock request")?;
        if !resp.status().is_success() {
            return Err(anyhow!("wallet service unlock: {}", resp.status()));
        }
        let body: UnlockResponse = resp.json().await.context("wallet service unlock json")?;
        body.private_key.trim().parse().context("unlocked key parse")
    }
}

#[derive(Debug, Serialize)]
struct UserOperation {
    sender: String,
    nonce: String,
    #[serde(rename = "callData")]
    call_data: String,
    signature: String,
    #[serde(rename = "clientOpId")]
    client_op_id: String,
}

#[derive(Debug, Deserialize)]
struct UserOpReceipt {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    receipt: Option<UserOpInnerReceipt>,
}

#[derive(Debug, Deserialize)]
struct UserOpInnerReceipt {
    #[serde(rename = "transactionHash")]
    transaction_hash: String,
}

pub struct BundlerClient {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    rpc: RpcClient,
    vault: Arc<dyn KeyVault>,
    chain_id: u64,
    entry_point: Address,
    arena: Address,
    molti: Address,
}

impl BundlerClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        api_key: Option<String>,
        rpc: RpcClient,
        vault: Arc<dyn KeyVault>,
        chain_id: u64,
        entry_point: Address,
        arena: Address,
        molti: Address,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("bundler http client")?;
        Ok(Self {
            http,
            url,
            api_key,
            rpc,
            vault,
            chain_id,
            entry_point,
            arena,
            molti,
        })
    }

    async fn rpc_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let mut req = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        let resp = req.send().await.with_context(|| format!("bundler {method}"))?;
        let parsed: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("bundler json {method}"))?;
        if let Some(err) = parsed.get("error").filter(|e| !e.is_null()) {
            return Err(anyhow!("bundler error: {err}"));
        }
        parsed
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("bundler {method}: empty result"))
    }

    async fn account_nonce(&self, sender: Address) -> Result<U256> {
        let call = IEntryPoint::getNonceCall {
            sender,
            key: alloy::primitives::aliases::U192::ZERO,
        };
        let out = self.rpc.call(self.entry_point, &call.abi_encode()).await?;
        IEntryPoint::getNonceCall::abi_decode_returns(&out).context("getNonce decode")
    }

    fn user_op_hash(&self, sender: Address, nonce: U256, call_data: &[u8]) -> B256 {
        let mut buf = Vec::with_capacity(20 + 32 + 32 + 32 + 20);
        buf.extend_from_slice(sender.as_slice());
        buf.extend_from_slice(&nonce.to_be_bytes::<32>());
        buf.extend_from_slice(keccak256(call_data).as_slice());
        buf.extend_from_slice(&U256::from(self.chain_id).to_be_bytes::<32>());
        buf.extend_from_slice(self.entry_point.as_slice());
        keccak256(&buf)
    }

    /// Retrying wrapper around one logical user operation. All attempts
    /// share one client op id so the bundler can dedupe a send whose
    /// response was lost.
    async fn submit_with_retry(
        &self,
        label: &str,
        wallet: &AgentWallet,
        target: Address,
        data: Vec<u8>,
    ) -> Result<B256> {
        let op_id = Uuid::new_v4();
        retry(label, RetryOpts::default(), || {
            let data = data.clone();
            async move { self.submit(wallet, target, data, op_id).await }
        })
        .await
    }

    /// Wrap a target call into the smart account, sign and submit it, and
    /// wait for the inclusion receipt. Returns the on-chain tx hash.
    async fn submit(
        &self,
        wallet: &AgentWallet,
        target: Address,
        data: Vec<u8>,
        op_id: Uuid,
    ) -> Result<B256> {
        let signer = self.vault.unlock(&wallet.encrypted_signer_key).await?;
        let nonce = self.account_nonce(wallet.smart_account).await?;

        let call_data = ISmartAccount::executeCall {
            dest: target,
            value: U256::ZERO,
            func: data.into(),
        }
        .abi_encode();

        let hash = self.user_op_hash(wallet.smart_account, nonce, &call_data);
        let signature = signer.sign_hash_sync(&hash).context("user op sign")?;

        let op = UserOperation {
            sender: format!("{:#x}", wallet.smart_account),
            nonce: format!("{nonce:#x}"),
            call_data: format!("0x{}", hex::encode(&call_data)),
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
            client_op_id: op_id.to_string(),
        };

        let result = self
            .rpc_request(
                "eth_sendUserOperation",
                serde_json::json!([op, format!("{:#x}", self.entry_point)]),
            )
            .await?;
        let op_hash = result
            .as_str()
            .ok_or_else(|| anyhow!("bundler returned non-string op hash"))?
            .to_string();

        self.wait_for_user_op(&op_hash).await
    }

    async fn wait_for_user_op(&self, op_hash: &str) -> Result<B256> {
        let deadline = tokio::time::Instant::now() + USEROP_RECEIPT_TIMEOUT;
        loop {
            let result = self
                .rpc_request("eth_getUserOperationReceipt", serde_json::json!([op_hash]))
                .await?;
            if !result.is_null() {
                let receipt: UserOpReceipt =
                    serde_json::from_value(result).context("user op receipt parse")?;
                let inner = receipt
                    .receipt
                    .ok_or_else(|| anyhow!("user op receipt missing inner receipt"))?;
                if !receipt.success {
                    return Err(anyhow!(
                        "user operation reverted in tx {}",
                        inner.transaction_hash
                    ));
                }
                return inner
                    .transaction_hash
                    .parse::<B256>()
                    .context("user op tx hash parse");
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("user op receipt timeout for {op_hash}"));
            }
            sleep(USEROP_RECEIPT_POLL).await;
        }
    }
}

#[async_trait]
impl TradeSubmitter for BundlerClient {
    async fn execute_trade(
        &self,
        wallet: &AgentWallet,
        params: ExecuteTradeParams,
    ) -> Result<B256> {
        let call = IArena::executeTradeCall {
            agentId: U256::from(params.agent_id),
            arenaId: U256::from(params.arena_id),
            epochId: U256::from(params.epoch_id),
            action: params.action.as_u8(),
            sizePctWei: to_wei18(params.size_pct),
            buyAmountWei: params.buy_amount_wei,
            priceWei: to_wei18(params.price),
            tick: params.tick,
        };
        self.submit_with_retry("executeTrade", wallet, self.arena, call.abi_encode())
            .await
    }

    async fn approve_arena_spend(&self, wallet: &AgentWallet) -> Result<B256> {
        let call = IERC20::approveCall {
            spender: self.arena,
            amount: U256::MAX,
        };
        self.submit_with_retry("approve", wallet, self.molti, call.abi_encode())
            .await
    }

    async fn auto_renew(
        &self,
        wallet: &AgentWallet,
        agent_id: u64,
        arena_id: u64,
        epoch_id: u64,
    ) -> Result<B256> {
        let call = IArena::autoRenewEpochCall {
            agentId: U256::from(agent_id),
            arenaId: U256::from(arena_id),
            epochId: U256::from(epoch_id),
        };
        self.submit_with_retry("autoRenewEpoch", wallet, self.arena, call.abi_encode())
            .await
    }

    async fn simulate_auto_renew(
        &self,
        wallet: &AgentWallet,
        agent_id: u64,
        arena_id: u64,
        epoch_id: u64,
    ) -> Result<()> {
        let call = IArena::autoRenewEpochCall {
            agentId: U256::from(agent_id),
            arenaId: U256::from(arena_id),
            epochId: U256::from(epoch_id),
        };
        self.rpc
            .call_from(Some(wallet.smart_account), self.arena, &call.abi_encode())
            .await
            .context("autoRenewEpoch simulate")?;
        Ok(())
    }
}
