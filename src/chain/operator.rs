//! Operator wallet: arena lifecycle transactions signed locally and
//! submitted as raw EIP-1559 transactions.

use crate::chain::abi::{self, IArena};
use crate::chain::rpc::{RpcClient, TxReceipt};
use crate::chain::{CreateEpochOutcome, OperatorGateway};
use crate::retry::{retry, RetryOpts};
use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, LogData, TxKind, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolCall, SolEvent};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(90);
const FALLBACK_GAS_LIMIT: u64 = 1_500_000;

pub struct OperatorWallet {
    rpc: RpcClient,
    signer: PrivateKeySigner,
    address: Address,
    chain_id: u64,
    arena: Address,
}

impl OperatorWallet {
    pub fn new(rpc: RpcClient, private_key: &str, chain_id: u64, arena: Address) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .context("OPERATOR_PRIVATE_KEY parse")?;
        let address = signer.address();
        info!(operator = %address, "🔑 Operator wallet ready");
        Ok(Self {
            rpc,
            signer,
            address,
            chain_id,
            arena,
        })
    }

    /// Sign and submit one call to the arena contract, then wait for its
    /// receipt. A mined-but-reverted transaction is an error.
    async fn send_call(&self, label: &str, calldata: Vec<u8>) -> Result<TxReceipt> {
        let receipt = retry(label, RetryOpts::default(), || {
            let calldata = calldata.clone();
            async move { self.send_once(&calldata).await }
        })
        .await?;
        if !receipt.status {
            return Err(anyhow!("{label} reverted in tx {:#x}", receipt.tx_hash));
        }
        Ok(receipt)
    }

    async fn send_once(&self, calldata: &[u8]) -> Result<TxReceipt> {
        let nonce = self.rpc.transaction_count(self.address).await?;
        let gas_price = self.rpc.gas_price().await?;
        let priority = self.rpc.max_priority_fee().await?;
        let gas_limit = match self.rpc.estimate_gas(self.address, self.arena, calldata).await {
            Ok(est) => est + est / 5,
            // A revert at estimation time is the call failing, not the
            // estimator: surface it with its data for decoding.
            Err(e) if abi::revert_reason(&e).is_some() || e.to_string().contains("revert") => {
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, "gas estimate failed, using fallback limit");
                FALLBACK_GAS_LIMIT
            }
        };

        let mut tx = TxEip1559 {
            chain_id: self.chain_id,
            nonce,
            gas_limit,
            max_fee_per_gas: gas_price * 2,
            max_priority_fee_per_gas: priority,
            to: TxKind::Call(self.arena),
            value: U256::ZERO,
            access_list: Default::default(),
            input: calldata.to_vec().into(),
        };
        let signature = self
            .signer
            .sign_transaction_sync(&mut tx)
            .context("operator sign")?;
        let envelope: TxEnvelope = tx.into_signed(signature).into();
        let raw = envelope.encoded_2718();

        let tx_hash = self.rpc.send_raw_transaction(&raw).await?;
        self.rpc.wait_for_receipt(tx_hash, SEND_TIMEOUT).await
    }
}

#[async_trait]
impl OperatorGateway for OperatorWallet {
    async fn create_epoch(
        &self,
        arena_id: u64,
        start_sec: i64,
        end_sec: i64,
    ) -> Result<CreateEpochOutcome> {
        let call = IArena::createEpochCall {
            arenaId: U256::from(arena_id),
            startTime: start_sec.max(0) as u64,
            endTime: end_sec.max(0) as u64,
        };
        let receipt = self.send_call("createEpoch", call.abi_encode()).await?;

        let mut epoch_id = None;
        for log in &receipt.logs {
            if log.address != self.arena {
                continue;
            }
            let data = LogData::new_unchecked(log.topics.clone(), log.data.clone().into());
            if let Ok(ev) = IArena::EpochCreated::decode_log_data(&data) {
                epoch_id = Some(ev.epochId.saturating_to::<u64>());
                break;
            }
        }
        Ok(CreateEpochOutcome {
            epoch_id,
            tx_hash: receipt.tx_hash,
        })
    }

    async fn end_epoch(&self, arena_id: u64, epoch_id: u64) -> Result<()> {
        let call = IArena::endEpochCall {
            arenaId: U256::from(arena_id),
            epochId: U256::from(epoch_id),
        };
        match self.send_call("endEpoch", call.abi_encode()).await {
            Ok(_) => Ok(()),
            Err(e) if abi::is_revert(&e, "EpochAlreadyEnded") => {
                info!(arena_id, epoch_id, "endEpoch: already ended on-chain");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_pending_rewards_batch(
        &self,
        arena_id: u64,
        epoch_id: u64,
        agent_ids: Vec<u64>,
        amounts: Vec<U256>,
    ) -> Result<B256> {
        if agent_ids.len() != amounts.len() {
            return Err(anyhow!(
                "reward batch mismatch: {} ids, {} amounts",
                agent_ids.len(),
                amounts.len()
            ));
        }
        let call = IArena::setPendingRewardsBatchCall {
            arenaId: U256::from(arena_id),
            epochId: U256::from(epoch_id),
            agentIds: agent_ids.into_iter().map(U256::from).collect(),
            amounts,
        };
        let receipt = self
            .send_call("setPendingRewardsBatch", call.abi_encode())
            .await?;
        Ok(receipt.tx_hash)
    }

    async fn sweep_unclaimed(
        &self,
        arena_id: u64,
        epoch_id: u64,
        agent_ids: Vec<u64>,
    ) -> Result<B256> {
        let call = IArena::sweepUnclaimedRewardsCall {
            arenaId: U256::from(arena_id),
            epochId: U256::from(epoch_id),
            agentIds: agent_ids.into_iter().map(U256::from).collect(),
        };
        let receipt = self
            .send_call("sweepUnclaimedRewards", call.abi_encode())
            .await?;
        Ok(receipt.tx_hash)
    }
}
