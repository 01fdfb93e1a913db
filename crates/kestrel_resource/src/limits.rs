//! Per-account elastic resource accounting.
//!
//! Responsibilities, per resource:
//! - fold usage samples into per-account sliding windows;
//! - enforce each account's fractional share of the virtual capacity;
//! - enforce the block-level CPU (per shard) and NET (block-wide) budgets;
//! - at block finalization, fold pending usage into the elastic windows,
//!   recompute virtual limits, apply pending account-limit rows and reset.
//!
//! Row placement: the shared store holds the account limits rows (actual
//! and pending shadows), the metering config and the NET elastic state
//! with the chain-wide weight totals; each shard store (the main store
//! included) holds its accounts' usage rows and its own CPU elastic
//! state. The block-wide pending NET counter lives in an injected
//! lock-guarded cell, not in versioned storage.

use std::sync::Arc;

use kestrel_common::config::MAX_ELASTIC_RESOURCE_MULTIPLIER;
use kestrel_common::error::{KestrelResult, ResourceError, StoreError};
use kestrel_common::name::Name;
use kestrel_common::observer::LedgerObserver;
use kestrel_common::resource::{
    integer_divide_ceil, AccountResourceLimit, ElasticLimitParams, ResourceLimits,
    ResourceLimitsConfig, ResourceLimitsState, RATE_LIMITING_PRECISION,
};
use kestrel_db::DatabaseManager;
use kestrel_store::{StoreHandle, VersionedStore};
use tracing::{debug, info};

use crate::pending_net::BlockPendingNet;

/// Saturating narrowing cast for user-facing limit rows.
fn downgrade(value: u128) -> i64 {
    value.min(i64::MAX as u128) as i64
}

pub struct ResourceLimitsManager {
    dbm: Arc<DatabaseManager>,
    observer: Arc<dyn LedgerObserver>,
    pending_net: Arc<BlockPendingNet>,
}

impl ResourceLimitsManager {
    pub fn new(dbm: Arc<DatabaseManager>, observer: Arc<dyn LedgerObserver>) -> Self {
        Self::with_pending_net(dbm, observer, Arc::new(BlockPendingNet::new()))
    }

    /// Construct with an externally owned pending-NET cell (shared with
    /// the parallel executors driving other shards).
    pub fn with_pending_net(
        dbm: Arc<DatabaseManager>,
        observer: Arc<dyn LedgerObserver>,
        pending_net: Arc<BlockPendingNet>,
    ) -> Self {
        ResourceLimitsManager { dbm, observer, pending_net }
    }

    pub fn pending_net(&self) -> Arc<BlockPendingNet> {
        self.pending_net.clone()
    }

    // ── Initialization ─────────────────────────────────────────────────────

    /// Create the config and state rows in the main and shared stores.
    /// Virtual limits start at `max`: the chain boots congested and must
    /// earn headroom (slow start).
    pub fn initialize(&self, config: ResourceLimitsConfig) -> KestrelResult<()> {
        config.cpu_limit_parameters.validate()?;
        config.net_limit_parameters.validate()?;
        let state = ResourceLimitsState {
            virtual_cpu_limit: config.cpu_limit_parameters.max,
            virtual_net_limit: config.net_limit_parameters.max,
            ..Default::default()
        };
        for store in [self.dbm.main_db(), self.dbm.shared_db()] {
            let mut db = store.write();
            db.set_res_config(config)?;
            db.set_res_state(state)?;
        }
        info!(
            virtual_cpu_limit = state.virtual_cpu_limit,
            virtual_net_limit = state.virtual_net_limit,
            "resource limits initialized"
        );
        Ok(())
    }

    /// Idempotent lazy creation of a shard's CPU elastic state.
    pub fn ensure_shard_state(&self, db: &mut VersionedStore) -> KestrelResult<()> {
        if db.res_state().is_some() {
            return Ok(());
        }
        let shared = self.dbm.shared_db();
        let config = read_config(&shared.read())?;
        // The shard starts congested too.
        db.set_res_state(ResourceLimitsState {
            virtual_cpu_limit: config.cpu_limit_parameters.max,
            ..Default::default()
        })?;
        debug!(store = %db.name(), "shard resource state created");
        Ok(())
    }

    /// Create a new account's limits (shared store) and usage (main
    /// store) rows.
    pub fn initialize_account(&self, account: Name) -> KestrelResult<()> {
        self.dbm
            .shared_db()
            .write()
            .insert_limits(ResourceLimits::unlimited(account))?;
        self.dbm.main_db().write().create_usage(account)?;
        Ok(())
    }

    /// Update the elastic parameters; no-op when unchanged.
    pub fn set_block_parameters(
        &self,
        cpu_limit_parameters: ElasticLimitParams,
        net_limit_parameters: ElasticLimitParams,
    ) -> KestrelResult<()> {
        cpu_limit_parameters.validate()?;
        net_limit_parameters.validate()?;
        for store in [self.dbm.main_db(), self.dbm.shared_db()] {
            let mut db = store.write();
            let mut config = read_config(&db)?;
            if config.cpu_limit_parameters == cpu_limit_parameters
                && config.net_limit_parameters == net_limit_parameters
            {
                return Ok(());
            }
            config.cpu_limit_parameters = cpu_limit_parameters;
            config.net_limit_parameters = net_limit_parameters;
            db.set_res_config(config)?;
        }
        Ok(())
    }

    // ── Per-transaction accounting ─────────────────────────────────────────

    /// Fold zero-samples into the accounts' windows so their averages
    /// decay to the current ordinal.
    pub fn update_account_usage(
        &self,
        accounts: &[Name],
        ordinal: u32,
        db: &mut VersionedStore,
        shared: &VersionedStore,
    ) -> KestrelResult<()> {
        let config = read_config(shared)?;
        for &account in accounts {
            let usage = db.modify_usage(account, |u| {
                u.net_usage.add(0, ordinal, config.account_net_usage_average_window);
                u.cpu_usage.add(0, ordinal, config.account_cpu_usage_average_window);
            })?;
            self.observer
                .usage_updated(account, usage.net_usage.average(), usage.cpu_usage.average());
        }
        Ok(())
    }

    /// Bill a transaction's CPU and NET to its authorizing accounts and
    /// enforce the per-account and per-block budgets.
    pub fn add_transaction_usage(
        &self,
        accounts: &[Name],
        cpu_usage: u64,
        net_usage: u64,
        ordinal: u32,
        db: &mut VersionedStore,
        shared: &VersionedStore,
    ) -> KestrelResult<()> {
        let config = read_config(shared)?;
        let state = read_state(shared)?;
        let shard_state = db.res_state().copied().ok_or(ResourceError::MissingStateObject)?;

        for &account in accounts {
            let usage = db.modify_usage(account, |u| {
                u.net_usage.add(net_usage, ordinal, config.account_net_usage_average_window);
                u.cpu_usage.add(cpu_usage, ordinal, config.account_cpu_usage_average_window);
            })?;
            self.observer
                .usage_updated(account, usage.net_usage.average(), usage.cpu_usage.average());

            let (_ram, net_weight, cpu_weight) = self.get_account_limits(account, shared)?;

            if cpu_weight >= 0 && state.total_cpu_weight > 0 {
                let window_size = config.account_cpu_usage_average_window as u128;
                let capacity_in_window = shard_state.virtual_cpu_limit as u128 * window_size;
                let cpu_used_in_window =
                    usage.cpu_usage.value_ex as u128 * window_size / RATE_LIMITING_PRECISION as u128;
                let max_user_use_in_window = capacity_in_window * cpu_weight as u128
                    / state.total_cpu_weight as u128;
                if cpu_used_in_window > max_user_use_in_window {
                    return Err(ResourceError::CpuUsageExceeded {
                        account,
                        used: cpu_used_in_window,
                        allowed: max_user_use_in_window,
                    }
                    .into());
                }
            }

            if net_weight >= 0 && state.total_net_weight > 0 {
                let window_size = config.account_net_usage_average_window as u128;
                // virtual_net_limit was refreshed by process_block_usage from
                // the block-wide pending NET counter.
                let capacity_in_window = state.virtual_net_limit as u128 * window_size;
                let net_used_in_window =
                    usage.net_usage.value_ex as u128 * window_size / RATE_LIMITING_PRECISION as u128;
                let max_user_use_in_window = capacity_in_window * net_weight as u128
                    / state.total_net_weight as u128;
                if net_used_in_window > max_user_use_in_window {
                    return Err(ResourceError::NetUsageExceeded {
                        account,
                        used: net_used_in_window,
                        allowed: max_user_use_in_window,
                    }
                    .into());
                }
            }
        }

        // Account for this transaction at block level and do not exceed
        // those budgets either. CPU is tracked per executing shard; NET is
        // tracked once for the whole block, across all shards.
        db.modify_res_state(|s| s.pending_cpu_usage += cpu_usage)?;
        self.pending_net.add(net_usage)?;

        if self.pending_net.get() > config.net_limit_parameters.max {
            return Err(ResourceError::BlockResourceExhausted { resource: "net" }.into());
        }
        let pending_cpu = db
            .res_state()
            .copied()
            .ok_or(ResourceError::MissingStateObject)?
            .pending_cpu_usage;
        if pending_cpu > config.cpu_limit_parameters.max {
            return Err(ResourceError::BlockResourceExhausted { resource: "cpu" }.into());
        }
        Ok(())
    }

    /// Fold a signed RAM delta into the account's usage row.
    pub fn add_pending_ram_usage(
        &self,
        account: Name,
        ram_delta: i64,
        db: &mut VersionedStore,
    ) -> KestrelResult<()> {
        if ram_delta == 0 {
            return Ok(());
        }
        let current = db.usage(account).map(|u| u.ram_usage).unwrap_or(0);
        if ram_delta > 0 && u64::MAX - current < ram_delta as u64 {
            return Err(ResourceError::UsageOverflow("ram usage delta would overflow").into());
        }
        if ram_delta < 0 && current < ram_delta.unsigned_abs() {
            return Err(ResourceError::UsageOverflow("ram usage delta would underflow").into());
        }
        db.modify_usage(account, |u| {
            u.ram_usage = (u.ram_usage as i64 + ram_delta) as u64;
        })?;
        Ok(())
    }

    /// Assert the account is within its RAM allowance.
    pub fn verify_account_ram_usage(
        &self,
        account: Name,
        db: &VersionedStore,
        shared: &VersionedStore,
    ) -> KestrelResult<()> {
        let (ram_bytes, _net, _cpu) = self.get_account_limits(account, shared)?;
        let usage = db.usage(account).ok_or(ResourceError::MissingUsageObject(account))?;
        if ram_bytes >= 0 && usage.ram_usage > ram_bytes as u64 {
            return Err(ResourceError::RamUsageExceeded {
                account,
                needs: usage.ram_usage,
                available: ram_bytes,
            }
            .into());
        }
        Ok(())
    }

    pub fn get_account_ram_usage(&self, account: Name, db: &VersionedStore) -> i64 {
        db.usage(account).map(|u| u.ram_usage as i64).unwrap_or(0)
    }

    // ── Account limits ─────────────────────────────────────────────────────

    /// Write the account's limits into a "pending" shadow row that is
    /// applied at the next block boundary. Returns whether the new RAM
    /// limit is strictly more restrictive than the previous one.
    pub fn set_account_limits(
        &self,
        account: Name,
        ram_bytes: i64,
        net_weight: i64,
        cpu_weight: i64,
        shared: &mut VersionedStore,
    ) -> KestrelResult<bool> {
        if shared.limits(true, account).is_none() {
            let actual = shared
                .limits(false, account)
                .copied()
                .ok_or(ResourceError::MissingLimitsObject(account))?;
            shared.insert_limits(ResourceLimits { pending: true, ..actual })?;
        }
        // `limits` was just ensured above.
        let prior = shared
            .limits(true, account)
            .copied()
            .ok_or(ResourceError::MissingLimitsObject(account))?;

        let decreased_limit =
            ram_bytes >= 0 && (prior.ram_bytes < 0 || ram_bytes < prior.ram_bytes);

        shared.modify_limits(true, account, |row| {
            row.ram_bytes = ram_bytes;
            row.net_weight = net_weight;
            row.cpu_weight = cpu_weight;
        })?;
        self.observer.limits_updated(account, ram_bytes, net_weight, cpu_weight);
        Ok(decreased_limit)
    }

    /// (ram_bytes, net_weight, cpu_weight); the pending shadow row wins
    /// over the actual row when present.
    pub fn get_account_limits(
        &self,
        account: Name,
        shared: &VersionedStore,
    ) -> KestrelResult<(i64, i64, i64)> {
        let row = shared
            .limits(true, account)
            .or_else(|| shared.limits(false, account))
            .ok_or(ResourceError::MissingLimitsObject(account))?;
        Ok((row.ram_bytes, row.net_weight, row.cpu_weight))
    }

    pub fn is_unlimited_cpu(&self, account: Name, shared: &VersionedStore) -> bool {
        shared.limits(false, account).map(|row| row.cpu_weight == -1).unwrap_or(false)
    }

    // ── Block-boundary processing ──────────────────────────────────────────

    /// Drain every pending limits row into its actual row, maintaining
    /// the chain-wide weight totals. Called at block finalization; the
    /// totals move only here, never mid-block.
    pub fn process_account_limit_updates(&self) -> KestrelResult<()> {
        let shared = self.dbm.shared_db();
        let mut db = shared.write();
        loop {
            let pending = match db.first_pending_limits() {
                Some(row) => row,
                None => break,
            };
            let actual = db
                .limits(false, pending.owner)
                .copied()
                .ok_or(ResourceError::MissingLimitsObject(pending.owner))?;

            let mut state = read_state(&db)?;
            apply_total(&mut state.total_ram_bytes, actual.ram_bytes, pending.ram_bytes, "ram_bytes")?;
            apply_total(&mut state.total_cpu_weight, actual.cpu_weight, pending.cpu_weight, "cpu_weight")?;
            apply_total(&mut state.total_net_weight, actual.net_weight, pending.net_weight, "net_weight")?;
            db.set_res_state(state)?;

            db.modify_limits(false, pending.owner, |row| {
                row.ram_bytes = pending.ram_bytes;
                row.net_weight = pending.net_weight;
                row.cpu_weight = pending.cpu_weight;
            })?;
            db.remove_limits(true, pending.owner)?;
            self.observer.limits_updated(
                pending.owner,
                pending.ram_bytes,
                pending.net_weight,
                pending.cpu_weight,
            );
        }
        Ok(())
    }

    /// Fold the block's pending usage into the elastic windows, update
    /// the virtual limits and reset the pending counters: the NET state
    /// in the shared store, then the CPU state of the main store and of
    /// every shard that processed transactions this block.
    pub fn process_block_usage(
        &self,
        block_num: u32,
        processing_shards: &[StoreHandle],
    ) -> KestrelResult<()> {
        let shared = self.dbm.shared_db();
        let config = read_config(&shared.read())?;

        {
            let mut db = shared.write();
            let mut state = read_state(&db)?;
            state
                .average_block_net_usage
                .add(self.pending_net.get(), block_num, config.net_limit_parameters.periods);
            state.update_virtual_net_limit(&config);
            state.pending_net_usage = 0;
            db.set_res_state(state)?;
            debug!(
                block_num,
                virtual_net_limit = state.virtual_net_limit,
                "block net usage folded"
            );
        }
        self.pending_net.init();

        let main = self.dbm.main_db();
        for store in std::iter::once(&main).chain(processing_shards) {
            let mut db = store.write();
            let mut state = read_state(&db)?;
            state
                .average_block_cpu_usage
                .add(state.pending_cpu_usage, block_num, config.cpu_limit_parameters.periods);
            state.update_virtual_cpu_limit(&config);
            state.pending_cpu_usage = 0;
            db.set_res_state(state)?;
        }
        Ok(())
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    pub fn get_total_cpu_weight(&self) -> KestrelResult<u64> {
        Ok(read_state(&self.dbm.shared_db().read())?.total_cpu_weight)
    }

    pub fn get_total_net_weight(&self) -> KestrelResult<u64> {
        Ok(read_state(&self.dbm.shared_db().read())?.total_net_weight)
    }

    /// The main store's current virtual CPU limit.
    pub fn get_virtual_block_cpu_limit(&self) -> KestrelResult<u64> {
        Ok(read_state(&self.dbm.main_db().read())?.virtual_cpu_limit)
    }

    /// The chain-wide current virtual NET limit.
    pub fn get_virtual_block_net_limit(&self) -> KestrelResult<u64> {
        Ok(read_state(&self.dbm.shared_db().read())?.virtual_net_limit)
    }

    /// CPU still available in this block on the given shard.
    pub fn get_block_cpu_limit(
        &self,
        db: &VersionedStore,
        shared: &VersionedStore,
    ) -> KestrelResult<u64> {
        let config = read_config(shared)?;
        let pending = db.res_state().map(|s| s.pending_cpu_usage).unwrap_or(0);
        Ok(config.cpu_limit_parameters.max.saturating_sub(pending))
    }

    /// NET still available in this block, chain-wide.
    pub fn get_block_net_limit(&self, shared: &VersionedStore) -> KestrelResult<u64> {
        let config = read_config(shared)?;
        Ok(config.net_limit_parameters.max.saturating_sub(self.pending_net.get()))
    }

    pub fn get_account_cpu_limit(
        &self,
        account: Name,
        db: &VersionedStore,
        shared: &VersionedStore,
        greylist_limit: u32,
    ) -> KestrelResult<(i64, bool)> {
        let (arl, greylisted) =
            self.get_account_cpu_limit_ex(account, db, shared, greylist_limit, None)?;
        Ok((arl.available, greylisted))
    }

    /// Full CPU limit row for transaction admission. The shard's virtual
    /// CPU limit is clamped to `max * greylist_limit` for greylisted
    /// accounts.
    pub fn get_account_cpu_limit_ex(
        &self,
        account: Name,
        db: &VersionedStore,
        shared: &VersionedStore,
        greylist_limit: u32,
        current_time: Option<u32>,
    ) -> KestrelResult<(AccountResourceLimit, bool)> {
        let config = read_config(shared)?;
        let state = read_state(shared)?;
        let shard_state = db.res_state().copied().ok_or(ResourceError::MissingStateObject)?;
        let cpu_usage = db.usage(account).map(|u| u.cpu_usage).unwrap_or_default();
        let (_ram, _net, cpu_weight) = self.get_account_limits(account, shared)?;

        if cpu_weight < 0 || state.total_cpu_weight == 0 {
            return Ok((AccountResourceLimit::unlimited(cpu_usage.last_ordinal), false));
        }

        let window_size = config.account_cpu_usage_average_window;
        let (virtual_limit, greylisted) = greylist_clamp(
            shard_state.virtual_cpu_limit,
            config.cpu_limit_parameters.max,
            greylist_limit,
        );
        let arl = limit_row(cpu_usage, window_size, virtual_limit, cpu_weight as u128,
            state.total_cpu_weight as u128, current_time);
        Ok((arl, greylisted))
    }

    pub fn get_account_net_limit(
        &self,
        account: Name,
        db: &VersionedStore,
        shared: &VersionedStore,
        greylist_limit: u32,
    ) -> KestrelResult<(i64, bool)> {
        let (arl, greylisted) =
            self.get_account_net_limit_ex(account, db, shared, greylist_limit, None)?;
        Ok((arl.available, greylisted))
    }

    /// Full NET limit row for transaction admission.
    pub fn get_account_net_limit_ex(
        &self,
        account: Name,
        db: &VersionedStore,
        shared: &VersionedStore,
        greylist_limit: u32,
        current_time: Option<u32>,
    ) -> KestrelResult<(AccountResourceLimit, bool)> {
        let config = read_config(shared)?;
        let state = read_state(shared)?;
        let net_usage = db.usage(account).map(|u| u.net_usage).unwrap_or_default();
        let (_ram, net_weight, _cpu) = self.get_account_limits(account, shared)?;

        if net_weight < 0 || state.total_net_weight == 0 {
            return Ok((AccountResourceLimit::unlimited(net_usage.last_ordinal), false));
        }

        let window_size = config.account_net_usage_average_window;
        let (virtual_limit, greylisted) = greylist_clamp(
            state.virtual_net_limit,
            config.net_limit_parameters.max,
            greylist_limit,
        );
        let arl = limit_row(net_usage, window_size, virtual_limit, net_weight as u128,
            state.total_net_weight as u128, current_time);
        Ok((arl, greylisted))
    }
}

fn read_config(db: &VersionedStore) -> Result<ResourceLimitsConfig, StoreError> {
    db.res_config().copied().ok_or(StoreError::MissingSingleton("resource limits config"))
}

fn read_state(db: &VersionedStore) -> Result<ResourceLimitsState, ResourceError> {
    db.res_state().copied().ok_or(ResourceError::MissingStateObject)
}

/// Clamp a virtual limit for a greylisted account.
fn greylist_clamp(virtual_limit: u64, max: u64, greylist_limit: u32) -> (u64, bool) {
    if greylist_limit < MAX_ELASTIC_RESOURCE_MULTIPLIER {
        let greylisted_limit = max.saturating_mul(greylist_limit as u64);
        if greylisted_limit < virtual_limit {
            return (greylisted_limit, true);
        }
    }
    (virtual_limit, false)
}

/// Compute the used/available/max row from a usage window and the
/// account's fractional share of the virtual capacity.
fn limit_row(
    mut usage: kestrel_common::resource::UsageAccumulator,
    window_size: u32,
    virtual_limit: u64,
    user_weight: u128,
    all_user_weight: u128,
    current_time: Option<u32>,
) -> AccountResourceLimit {
    let window = window_size as u128;
    let capacity_in_window = virtual_limit as u128 * window;
    let max_user_use_in_window = capacity_in_window * user_weight / all_user_weight;
    let used_in_window =
        integer_divide_ceil(usage.value_ex as u128 * window, RATE_LIMITING_PRECISION as u128);

    let available = if max_user_use_in_window <= used_in_window {
        0
    } else {
        downgrade(max_user_use_in_window - used_in_window)
    };

    let mut arl = AccountResourceLimit {
        used: downgrade(used_in_window),
        available,
        max: downgrade(max_user_use_in_window),
        last_usage_update_time: usage.last_ordinal,
        current_used: downgrade(used_in_window),
    };
    if let Some(now) = current_time {
        if now > usage.last_ordinal {
            usage.add(0, now, window_size);
            arl.current_used = downgrade(integer_divide_ceil(
                usage.value_ex as u128 * window,
                RATE_LIMITING_PRECISION as u128,
            ));
        }
    }
    arl
}

/// Apply one pending limit value to its chain-wide total.
fn apply_total(
    total: &mut u64,
    old_value: i64,
    new_value: i64,
    which: &str,
) -> Result<(), ResourceError> {
    if old_value > 0 {
        if *total < old_value as u64 {
            return Err(ResourceError::RateLimitingStateInconsistent(format!(
                "underflow when reverting old value of {which}"
            )));
        }
        *total -= old_value as u64;
    }
    if new_value > 0 {
        if u64::MAX - *total < new_value as u64 {
            return Err(ResourceError::RateLimitingStateInconsistent(format!(
                "overflow when applying new value of {which}"
            )));
        }
        *total += new_value as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::name::name;
    use kestrel_common::observer::NoopObserver;
    use kestrel_common::resource::Ratio;

    fn small_config() -> ResourceLimitsConfig {
        ResourceLimitsConfig {
            cpu_limit_parameters: ElasticLimitParams {
                target: 100,
                max: 1000,
                periods: 10,
                max_multiplier: 1000,
                contract_rate: Ratio::new(99, 100),
                expand_rate: Ratio::new(1000, 999),
            },
            net_limit_parameters: ElasticLimitParams {
                target: 100,
                max: 1000,
                periods: 10,
                max_multiplier: 1000,
                contract_rate: Ratio::new(99, 100),
                expand_rate: Ratio::new(1000, 999),
            },
            account_cpu_usage_average_window: 10,
            account_net_usage_average_window: 10,
        }
    }

    fn setup() -> (Arc<DatabaseManager>, ResourceLimitsManager) {
        let dbm = Arc::new(DatabaseManager::new());
        let rlm = ResourceLimitsManager::new(dbm.clone(), Arc::new(NoopObserver));
        rlm.initialize(small_config()).unwrap();
        (dbm, rlm)
    }

    fn new_account(rlm: &ResourceLimitsManager, n: Name) {
        rlm.initialize_account(n).unwrap();
    }

    #[test]
    fn test_initialize_starts_congested() {
        let (_dbm, rlm) = setup();
        assert_eq!(rlm.get_virtual_block_cpu_limit().unwrap(), 1000);
        assert_eq!(rlm.get_virtual_block_net_limit().unwrap(), 1000);
    }

    #[test]
    fn test_ram_accounting_is_symmetric() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let main = dbm.main_db();
        let mut db = main.write();
        rlm.add_pending_ram_usage(name("alice"), 1000, &mut db).unwrap();
        assert_eq!(rlm.get_account_ram_usage(name("alice"), &db), 1000);
        rlm.add_pending_ram_usage(name("alice"), -1000, &mut db).unwrap();
        assert_eq!(rlm.get_account_ram_usage(name("alice"), &db), 0);
    }

    #[test]
    fn test_ram_underflow_rejected() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let main = dbm.main_db();
        let mut db = main.write();
        assert!(rlm.add_pending_ram_usage(name("alice"), -1, &mut db).is_err());
    }

    #[test]
    fn test_verify_ram_usage_over_limit_fails() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), 512, -1, -1, &mut shared.write()).unwrap();
        let main = dbm.main_db();
        let mut db = main.write();
        rlm.add_pending_ram_usage(name("alice"), 600, &mut db).unwrap();
        let err = rlm.verify_account_ram_usage(name("alice"), &db, &shared.read()).unwrap_err();
        assert!(err.is_deferrable());
        assert!(err.to_string().contains("insufficient ram"));
    }

    #[test]
    fn test_set_account_limits_reports_restriction() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        // From unlimited (-1) to 1024: more restrictive.
        assert!(rlm.set_account_limits(name("alice"), 1024, -1, -1, &mut shared.write()).unwrap());
        // Raising the limit is not a restriction.
        assert!(!rlm.set_account_limits(name("alice"), 2048, -1, -1, &mut shared.write()).unwrap());
        // Lowering again is.
        assert!(rlm.set_account_limits(name("alice"), 100, -1, -1, &mut shared.write()).unwrap());
    }

    #[test]
    fn test_pending_limits_apply_only_at_boundary() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), 4096, 10, 20, &mut shared.write()).unwrap();

        // Mid-block: the actual row still holds the old values and the
        // totals have not moved.
        {
            let db = shared.read();
            let actual = db.limits(false, name("alice")).unwrap();
            assert_eq!(actual.ram_bytes, -1);
            assert_eq!(read_state(&db).unwrap().total_cpu_weight, 0);
        }

        rlm.process_account_limit_updates().unwrap();

        let db = shared.read();
        let actual = db.limits(false, name("alice")).unwrap();
        assert_eq!(actual.ram_bytes, 4096);
        assert_eq!(actual.net_weight, 10);
        assert_eq!(actual.cpu_weight, 20);
        assert!(db.limits(true, name("alice")).is_none());
        let state = read_state(&db).unwrap();
        assert_eq!(state.total_net_weight, 10);
        assert_eq!(state.total_cpu_weight, 20);
        assert_eq!(state.total_ram_bytes, 4096);
    }

    #[test]
    fn test_setting_limits_twice_mutates_one_pending_row() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), 100, 1, 1, &mut shared.write()).unwrap();
        rlm.set_account_limits(name("alice"), 200, 2, 2, &mut shared.write()).unwrap();
        let db = shared.read();
        assert_eq!(db.limits_rows().filter(|r| r.pending).count(), 1);
        assert_eq!(db.limits(true, name("alice")).unwrap().ram_bytes, 200);
    }

    #[test]
    fn test_transaction_usage_within_budget() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), -1, 100, 100, &mut shared.write()).unwrap();
        rlm.process_account_limit_updates().unwrap();

        let main = dbm.main_db();
        let mut db = main.write();
        rlm.add_transaction_usage(&[name("alice")], 10, 10, 1, &mut db, &shared.read())
            .unwrap();
        let usage = db.usage(name("alice")).unwrap();
        assert_eq!(usage.cpu_usage.consumed, 10);
        assert_eq!(usage.net_usage.consumed, 10);
    }

    #[test]
    fn test_transaction_usage_over_share_fails() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        new_account(&rlm, name("whale"));
        let shared = dbm.shared_db();
        // alice holds 1 of 1001 total weight: a tiny share.
        rlm.set_account_limits(name("alice"), -1, 1, 1, &mut shared.write()).unwrap();
        rlm.set_account_limits(name("whale"), -1, 1000, 1000, &mut shared.write()).unwrap();
        rlm.process_account_limit_updates().unwrap();

        let main = dbm.main_db();
        let mut db = main.write();
        let err = rlm
            .add_transaction_usage(&[name("alice")], 500, 0, 1, &mut db, &shared.read())
            .unwrap_err();
        assert!(err.is_deferrable());
        assert!(err.to_string().contains("cpu"));
    }

    #[test]
    fn test_block_net_budget_is_shared_across_shards() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), -1, -1, -1, &mut shared.write()).unwrap();
        rlm.process_account_limit_updates().unwrap();

        let shard = dbm.add_shard_db(name("shard1"), 0).unwrap();
        rlm.ensure_shard_state(&mut shard.write()).unwrap();
        let main = dbm.main_db();

        // 600 on the main store, then 600 on the shard: the second must
        // trip the single block-wide NET budget of 1000.
        rlm.add_transaction_usage(&[name("alice")], 0, 600, 1, &mut main.write(), &shared.read())
            .unwrap();
        let err = rlm
            .add_transaction_usage(&[name("alice")], 0, 600, 1, &mut shard.write(), &shared.read())
            .unwrap_err();
        assert!(matches!(
            err,
            kestrel_common::KestrelError::Resource(
                ResourceError::BlockResourceExhausted { resource: "net" }
            )
        ));
    }

    #[test]
    fn test_block_cpu_budget_is_per_shard() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), -1, -1, -1, &mut shared.write()).unwrap();
        rlm.process_account_limit_updates().unwrap();

        let shard = dbm.add_shard_db(name("shard1"), 0).unwrap();
        rlm.ensure_shard_state(&mut shard.write()).unwrap();
        let main = dbm.main_db();

        // 600 CPU on each store: fine, each shard has its own budget.
        rlm.add_transaction_usage(&[name("alice")], 600, 0, 1, &mut main.write(), &shared.read())
            .unwrap();
        rlm.add_transaction_usage(&[name("alice")], 600, 0, 1, &mut shard.write(), &shared.read())
            .unwrap();
        // Another 600 on the shard exceeds that shard's block budget.
        let err = rlm
            .add_transaction_usage(&[name("alice")], 600, 0, 1, &mut shard.write(), &shared.read())
            .unwrap_err();
        assert!(err.to_string().contains("cpu"));
    }

    #[test]
    fn test_process_block_usage_folds_and_resets() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), -1, -1, -1, &mut shared.write()).unwrap();
        rlm.process_account_limit_updates().unwrap();

        let main = dbm.main_db();
        rlm.add_transaction_usage(&[name("alice")], 500, 900, 1, &mut main.write(), &shared.read())
            .unwrap();
        assert_eq!(rlm.pending_net().get(), 900);

        rlm.process_block_usage(1, &[]).unwrap();

        // Pendings reset; one block of usage (average 90, below the
        // target of 100) lets the virtual limit expand by 1000/999.
        assert_eq!(rlm.pending_net().get(), 0);
        assert_eq!(read_state(&main.read()).unwrap().pending_cpu_usage, 0);
        assert_eq!(rlm.get_virtual_block_net_limit().unwrap(), 1001);
        assert!(read_state(&shared.read()).unwrap().average_block_net_usage.average() > 0);
    }

    #[test]
    fn test_virtual_limit_expands_when_idle() {
        let (dbm, rlm) = setup();
        let shared = dbm.shared_db();
        for block in 1..=20 {
            rlm.process_block_usage(block, &[]).unwrap();
        }
        let state = read_state(&shared.read()).unwrap();
        assert!(state.virtual_net_limit > 1000);
        assert!(state.virtual_net_limit <= 1000 * 1000);
    }

    #[test]
    fn test_virtual_limit_contracts_under_sustained_congestion() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), -1, -1, -1, &mut shared.write()).unwrap();
        rlm.process_account_limit_updates().unwrap();
        let main = dbm.main_db();

        // Grow some headroom first.
        for block in 1..=200 {
            rlm.process_block_usage(block, &[]).unwrap();
        }
        let grown = read_state(&shared.read()).unwrap().virtual_net_limit;
        assert!(grown > 1000);

        // Saturate NET every block; the virtual limit must fall.
        for block in 201..=260 {
            rlm.add_transaction_usage(
                &[name("alice")],
                0,
                900,
                block,
                &mut main.write(),
                &shared.read(),
            )
            .unwrap();
            rlm.process_block_usage(block, &[]).unwrap();
        }
        let contracted = read_state(&shared.read()).unwrap().virtual_net_limit;
        assert!(contracted < grown);
        assert!(contracted >= 1000);
    }

    #[test]
    fn test_account_limit_ex_unlimited_account() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let main = dbm.main_db();
        let shared = dbm.shared_db();
        let (arl, greylisted) = rlm
            .get_account_cpu_limit_ex(
                name("alice"),
                &main.read(),
                &shared.read(),
                MAX_ELASTIC_RESOURCE_MULTIPLIER,
                None,
            )
            .unwrap();
        assert_eq!(arl.available, -1);
        assert_eq!(arl.max, -1);
        assert!(!greylisted);
    }

    #[test]
    fn test_account_limit_ex_tracks_usage() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), -1, 100, 100, &mut shared.write()).unwrap();
        rlm.process_account_limit_updates().unwrap();
        let main = dbm.main_db();
        rlm.add_transaction_usage(&[name("alice")], 40, 0, 1, &mut main.write(), &shared.read())
            .unwrap();

        let (arl, greylisted) = rlm
            .get_account_cpu_limit_ex(
                name("alice"),
                &main.read(),
                &shared.read(),
                MAX_ELASTIC_RESOURCE_MULTIPLIER,
                None,
            )
            .unwrap();
        assert!(!greylisted);
        assert!(arl.used > 0);
        assert_eq!(arl.last_usage_update_time, 1);
        assert_eq!(arl.available, arl.max - arl.used);
        // Sole weight holder: the whole virtual capacity is alice's.
        assert_eq!(arl.max, 1000 * 10);
    }

    #[test]
    fn test_account_limit_ex_greylist_clamps_capacity() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), -1, 100, 100, &mut shared.write()).unwrap();
        rlm.process_account_limit_updates().unwrap();
        let main = dbm.main_db();

        // Expand the shared virtual NET limit well past max.
        for block in 1..=200 {
            rlm.process_block_usage(block, &[]).unwrap();
        }
        let expanded = read_state(&shared.read()).unwrap().virtual_net_limit;
        assert!(expanded > 1000);

        let (normal, g1) = rlm
            .get_account_net_limit_ex(
                name("alice"),
                &main.read(),
                &shared.read(),
                MAX_ELASTIC_RESOURCE_MULTIPLIER,
                None,
            )
            .unwrap();
        let (greylisted, g2) = rlm
            .get_account_net_limit_ex(name("alice"), &main.read(), &shared.read(), 1, None)
            .unwrap();
        assert!(!g1);
        assert!(g2);
        assert!(greylisted.max < normal.max);
        assert_eq!(greylisted.max, 1000 * 10);
    }

    #[test]
    fn test_account_limit_ex_current_used_decays() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), -1, 100, 100, &mut shared.write()).unwrap();
        rlm.process_account_limit_updates().unwrap();
        let main = dbm.main_db();
        rlm.add_transaction_usage(&[name("alice")], 100, 0, 1, &mut main.write(), &shared.read())
            .unwrap();

        let (at_once, _) = rlm
            .get_account_cpu_limit_ex(
                name("alice"),
                &main.read(),
                &shared.read(),
                MAX_ELASTIC_RESOURCE_MULTIPLIER,
                Some(1),
            )
            .unwrap();
        let (later, _) = rlm
            .get_account_cpu_limit_ex(
                name("alice"),
                &main.read(),
                &shared.read(),
                MAX_ELASTIC_RESOURCE_MULTIPLIER,
                Some(6),
            )
            .unwrap();
        let (expired, _) = rlm
            .get_account_cpu_limit_ex(
                name("alice"),
                &main.read(),
                &shared.read(),
                MAX_ELASTIC_RESOURCE_MULTIPLIER,
                Some(100),
            )
            .unwrap();
        assert!(later.current_used < at_once.current_used);
        assert_eq!(expired.current_used, 0);
        // The stored row is untouched by the projection.
        assert_eq!(later.used, at_once.used);
    }

    #[test]
    fn test_usage_window_decays_with_zero_samples() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), -1, -1, -1, &mut shared.write()).unwrap();
        rlm.process_account_limit_updates().unwrap();
        let main = dbm.main_db();
        rlm.add_transaction_usage(&[name("alice")], 100, 100, 1, &mut main.write(), &shared.read())
            .unwrap();
        // Past a full window of idle ordinals the average reaches zero.
        rlm.update_account_usage(&[name("alice")], 11, &mut main.write(), &shared.read())
            .unwrap();
        let usage = main.read().usage(name("alice")).copied().unwrap();
        assert_eq!(usage.cpu_usage.average(), 0);
        assert_eq!(usage.net_usage.average(), 0);
    }

    #[test]
    fn test_is_unlimited_cpu() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        assert!(rlm.is_unlimited_cpu(name("alice"), &shared.read()));
        rlm.set_account_limits(name("alice"), -1, -1, 5, &mut shared.write()).unwrap();
        rlm.process_account_limit_updates().unwrap();
        assert!(!rlm.is_unlimited_cpu(name("alice"), &shared.read()));
    }

    #[test]
    fn test_block_limits_report_remaining_budget() {
        let (dbm, rlm) = setup();
        new_account(&rlm, name("alice"));
        let shared = dbm.shared_db();
        rlm.set_account_limits(name("alice"), -1, -1, -1, &mut shared.write()).unwrap();
        rlm.process_account_limit_updates().unwrap();
        let main = dbm.main_db();
        rlm.add_transaction_usage(&[name("alice")], 100, 250, 1, &mut main.write(), &shared.read())
            .unwrap();
        assert_eq!(rlm.get_block_cpu_limit(&main.read(), &shared.read()).unwrap(), 900);
        assert_eq!(rlm.get_block_net_limit(&shared.read()).unwrap(), 750);
    }
}
