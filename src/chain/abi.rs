//! Arena contract surface and fixed-point conversions.
//!
//! The `sol!` declarations are the single source for call encoding, return
//! decoding, `EpochCreated` decoding and revert-selector decoding. Any
//! divergence in the deployed ABI takes precedence over this file.

use alloy::primitives::U256;
use alloy::sol;
use alloy::sol_types::SolInterface;

sol! {
    interface IArena {
        function createAgent(address owner, bytes32 profileHash) external returns (uint256 agentId);
        function createArena(address token) external returns (uint256 arenaId);
        function registerToArena(uint256 agentId, uint256 arenaId) external;

        function createEpoch(uint256 arenaId, uint64 startTime, uint64 endTime) external;
        function autoRenewEpoch(uint256 agentId, uint256 arenaId, uint256 epochId) external;
        function endEpoch(uint256 arenaId, uint256 epochId) external;
        function setPendingRewardsBatch(uint256 arenaId, uint256 epochId, uint256[] agentIds, uint256[] amounts) external;
        function sweepUnclaimedRewards(uint256 arenaId, uint256 epochId, uint256[] agentIds) external;
        function getPendingReward(uint256 arenaId, uint256 epochId, uint256 agentId) external view returns (uint256 amount);

        function executeTrade(
            uint256 agentId,
            uint256 arenaId,
            uint256 epochId,
            uint8 action,
            uint256 sizePctWei,
            uint256 buyAmountWei,
            uint256 priceWei,
            uint64 tick
        ) external;

        function getPortfolio(uint256 agentId, uint256 arenaId) external view returns (uint256 moltiLocked, uint256 tokenUnits);
        function nextEpochId(uint256 arenaId) external view returns (uint256 epochId);
        function epochs(uint256 arenaId, uint256 epochId) external view returns (uint64 startTime, uint64 endTime, bool ended, uint256 rewardPool);
        function getEpochPhase(uint256 arenaId, uint64 nowSec) external view returns (uint256 toEnd, bool hasToEnd, uint256 active, bool hasActive);
        function registeredAgents(uint256 arenaId) external view returns (uint256[] agentIds);
        function isEpochRegistered(uint256 arenaId, uint256 epochId, uint256 agentId) external view returns (bool renewed);

        event EpochCreated(uint256 indexed arenaId, uint256 indexed epochId, uint64 startTime, uint64 endTime);

        error InsufficientAgentBalance(uint256 agentId, uint256 required, uint256 available);
        error NotRegistered(uint256 agentId, uint256 arenaId);
        error EpochNotFound(uint256 arenaId, uint256 epochId);
        error EpochAlreadyEnded(uint256 arenaId, uint256 epochId);
        error AgentNotFound(uint256 agentId);
        error ArenaNotFound(uint256 arenaId);
    }

    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256 balance);
        function allowance(address owner, address spender) external view returns (uint256 remaining);
        function approve(address spender, uint256 amount) external returns (bool ok);
    }

    interface ISmartAccount {
        function execute(address dest, uint256 value, bytes func) external;
    }

    interface IEntryPoint {
        function getNonce(address sender, uint192 key) external view returns (uint256 nonce);
    }
}

pub const WAD: u128 = 1_000_000_000_000_000_000;

/// 18-decimal fixed point, truncating toward zero. Non-finite and negative
/// inputs map to zero.
pub fn to_wei18(x: f64) -> U256 {
    if !x.is_finite() || x <= 0.0 {
        return U256::ZERO;
    }
    let scaled = x * WAD as f64;
    if scaled >= u128::MAX as f64 {
        return U256::from(u128::MAX);
    }
    U256::from(scaled as u128)
}

pub fn from_wei18(w: U256) -> f64 {
    let wad = U256::from(WAD);
    let whole = (w / wad).saturating_to::<u128>() as f64;
    let frac = (w % wad).to::<u128>() as f64 / WAD as f64;
    whole + frac
}

/// `amount · pct` in wei, truncated to 18-decimal fixed point.
pub fn mul_pct_wei(amount_wei: U256, pct: f64) -> U256 {
    amount_wei * to_wei18(pct) / U256::from(WAD)
}

/// Decode raw revert data against the arena ABI into a human reason.
pub fn decode_revert(data: &[u8]) -> Option<String> {
    let decoded = IArena::IArenaErrors::abi_decode(data).ok()?;
    Some(match decoded {
        IArena::IArenaErrors::InsufficientAgentBalance(e) => format!(
            "InsufficientAgentBalance(agent={}, required={}, available={})",
            e.agentId, e.required, e.available
        ),
        IArena::IArenaErrors::NotRegistered(e) => {
            format!("NotRegistered(agent={}, arena={})", e.agentId, e.arenaId)
        }
        IArena::IArenaErrors::EpochNotFound(e) => {
            format!("EpochNotFound(arena={}, epoch={})", e.arenaId, e.epochId)
        }
        IArena::IArenaErrors::EpochAlreadyEnded(e) => {
            format!("EpochAlreadyEnded(arena={}, epoch={})", e.arenaId, e.epochId)
        }
        IArena::IArenaErrors::AgentNotFound(e) => format!("AgentNotFound(agent={})", e.agentId),
        IArena::IArenaErrors::ArenaNotFound(e) => format!("ArenaNotFound(arena={})", e.arenaId),
    })
}

/// Walk an error's cause chain for hex revert data and decode it.
pub fn revert_reason(err: &anyhow::Error) -> Option<String> {
    for cause in err.chain() {
        let msg = cause.to_string();
        for candidate in extract_hex_blobs(&msg) {
            if let Some(reason) = decode_revert(&candidate) {
                return Some(reason);
            }
        }
    }
    None
}

/// True when the error's cause chain decodes to the given arena error name.
pub fn is_revert(err: &anyhow::Error, error_name: &str) -> bool {
    revert_reason(err)
        .map(|r| r.starts_with(error_name))
        .unwrap_or(false)
}

fn extract_hex_blobs(msg: &str) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let bytes = msg.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'0' && (bytes[i + 1] == b'x' || bytes[i + 1] == b'X') {
            let start = i + 2;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
                end += 1;
            }
            // Selector alone is 4 bytes; anything shorter is not revert data.
            if end - start >= 8 && (end - start) % 2 == 0 {
                if let Ok(raw) = hex::decode(&msg[start..end]) {
                    out.push(raw);
                }
            }
            i = end;
        } else {
            i += 1;
        }
    }
    out
}
