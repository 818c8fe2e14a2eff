//! TPC-C-style benchmark workload.
//!
//! Five transaction types mixed per emulated user against a fixed
//! warehouse/district/customer schema. Entities are stored as opaque
//! version-prefixed blobs with update-in-place semantics; the format is
//! private to this workload. Warehouses are partitioned contiguously
//! across client processes, and only transactions inside the measurement
//! window (after warmup, before cooldown) count toward metrics.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{Db, DbError, KvTransaction};
use crate::error::{HarnessError, HarnessResult};
use crate::metrics::{LatencyReservoir, PerfMetric};
use crate::workload::{Workload, WorkloadContext};

const DESCRIPTION: &str = "TPCC";
const LATENCIES_STORED: usize = 1000;
const DISTRICTS_PER_WAREHOUSE: usize = 10;
const GLOBAL_STATE_POLL: Duration = Duration::from_secs(1);
const POPULATE_BATCH: usize = 500;
const BLOB_VERSION: u8 = 1;

const SYLLABLES: [&str; 10] = [
    "BAR", "OUGHT", "ABLE", "PRI", "PRES", "ESE", "ANTI", "CALLY", "ATION", "EING",
];

/// Non-uniform random helper from the TPC-C specification.
fn nurand(rng: &mut StdRng, c: u64, a: u64, x: u64, y: u64) -> u64 {
    (((rng.gen_range(0..=a) | rng.gen_range(x..=y)) + c) % (y - x + 1)) + x
}

/// Customer last name from the three low decimal digits.
fn gen_c_last(mut x: u64) -> String {
    let l = (x % 10) as usize;
    x /= 10;
    let m = (x % 10) as usize;
    x /= 10;
    let f = (x % 10) as usize;
    format!("{}{}{}", SYLLABLES[f], SYLLABLES[m], SYLLABLES[l])
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// Key layout, fixed-width so ids order lexicographically.

fn global_state_key() -> Vec<u8> {
    b"tpcc/global_state".to_vec()
}

fn warehouse_key(w: usize) -> Vec<u8> {
    format!("tpcc/warehouse/{w:06}").into_bytes()
}

fn district_key(w: usize, d: usize) -> Vec<u8> {
    format!("tpcc/district/{w:06}/{d:02}").into_bytes()
}

fn customer_key(w: usize, d: usize, c: usize) -> Vec<u8> {
    format!("tpcc/customer/{w:06}/{d:02}/{c:08}").into_bytes()
}

fn customer_index_key(w: usize, d: usize, last: &str, c: usize) -> Vec<u8> {
    format!("tpcc/customer_idx/{w:06}/{d:02}/{last}/{c:08}").into_bytes()
}

fn customer_index_prefix(w: usize, d: usize, last: &str) -> (Vec<u8>, Vec<u8>) {
    prefix_range(format!("tpcc/customer_idx/{w:06}/{d:02}/{last}/"))
}

fn order_key(w: usize, d: usize, o: usize) -> Vec<u8> {
    format!("tpcc/order/{w:06}/{d:02}/{o:08}").into_bytes()
}

fn order_index_key(w: usize, d: usize, c: usize, o: usize) -> Vec<u8> {
    format!("tpcc/order_idx/{w:06}/{d:02}/{c:08}/{o:08}").into_bytes()
}

fn order_index_prefix(w: usize, d: usize, c: usize) -> (Vec<u8>, Vec<u8>) {
    prefix_range(format!("tpcc/order_idx/{w:06}/{d:02}/{c:08}/"))
}

fn new_order_key(w: usize, d: usize, o: usize) -> Vec<u8> {
    format!("tpcc/new_order/{w:06}/{d:02}/{o:08}").into_bytes()
}

fn new_order_prefix(w: usize, d: usize) -> (Vec<u8>, Vec<u8>) {
    prefix_range(format!("tpcc/new_order/{w:06}/{d:02}/"))
}

fn order_line_key(w: usize, d: usize, o: usize, n: usize) -> Vec<u8> {
    format!("tpcc/order_line/{w:06}/{d:02}/{o:08}/{n:02}").into_bytes()
}

fn order_line_prefix(w: usize, d: usize, o: usize) -> (Vec<u8>, Vec<u8>) {
    prefix_range(format!("tpcc/order_line/{w:06}/{d:02}/{o:08}/"))
}

fn stock_key(w: usize, i: usize) -> Vec<u8> {
    format!("tpcc/stock/{w:06}/{i:08}").into_bytes()
}

fn item_key(i: usize) -> Vec<u8> {
    format!("tpcc/item/{i:08}").into_bytes()
}

fn history_key(id: Uuid) -> Vec<u8> {
    format!("tpcc/history/{id}").into_bytes()
}

fn prefix_range(prefix: String) -> (Vec<u8>, Vec<u8>) {
    let begin = prefix.into_bytes();
    let mut end = begin.clone();
    end.push(0xff);
    (begin, end)
}

// Entities. Serialized as a version byte followed by a self-describing
// body; only this workload reads or writes these blobs.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GlobalState {
    c_run: u64,
    c_load: u64,
    customers_per_district: usize,
    items_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Warehouse {
    w_id: usize,
    w_name: String,
    w_ytd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct District {
    d_w_id: usize,
    d_id: usize,
    d_name: String,
    d_ytd: f64,
    d_next_o_id: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Customer {
    c_id: usize,
    c_w_id: usize,
    c_d_id: usize,
    c_first: String,
    c_last: String,
    c_credit: String,
    c_balance: f64,
    c_ytd_payment: f64,
    c_payment_cnt: u64,
    c_delivery_count: u64,
    c_data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    o_id: usize,
    o_w_id: usize,
    o_d_id: usize,
    o_c_id: usize,
    o_ol_cnt: usize,
    o_carrier_id: Option<usize>,
    o_all_local: bool,
    o_entry_d: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderLine {
    ol_o_id: usize,
    ol_w_id: usize,
    ol_d_id: usize,
    ol_number: usize,
    ol_i_id: usize,
    ol_supply_w_id: usize,
    ol_quantity: i64,
    ol_amount: f64,
    ol_dist_info: String,
    ol_delivery_d: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NewOrderRecord {
    no_o_id: usize,
    no_w_id: usize,
    no_d_id: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Stock {
    s_i_id: usize,
    s_w_id: usize,
    s_quantity: i64,
    s_ytd: i64,
    s_order_cnt: u64,
    s_remote_cnt: u64,
    s_dist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Item {
    i_id: usize,
    i_name: String,
    i_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct History {
    h_c_id: usize,
    h_c_d_id: usize,
    h_c_w_id: usize,
    h_d_id: usize,
    h_w_id: usize,
    h_amount: f64,
    h_date: f64,
    h_data: String,
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    let mut out = vec![BLOB_VERSION];
    out.extend(serde_json::to_vec(value).unwrap_or_default());
    out
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DbError> {
    match bytes.split_first() {
        Some((&BLOB_VERSION, body)) => serde_json::from_slice(body)
            .map_err(|err| DbError::Failed(format!("record decode failed: {err}"))),
        Some((version, _)) => Err(DbError::Failed(format!(
            "unsupported record version {version}"
        ))),
        None => Err(DbError::Failed("empty record".to_string())),
    }
}

async fn read_entity<T: DeserializeOwned>(
    tr: &mut dyn KvTransaction,
    key: &[u8],
) -> Result<Option<T>, DbError> {
    match tr.get(key).await? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

fn write_entity<T: Serialize>(tr: &mut dyn KvTransaction, key: &[u8], value: &T) {
    tr.set(key, &encode(value));
}

/// Which of the five transaction types a uniform draw in [0, 100) selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnKind {
    StockLevel,
    Delivery,
    OrderStatus,
    Payment,
    NewOrder,
}

fn txn_kind_for(draw: u64) -> TxnKind {
    if draw < 4 {
        TxnKind::StockLevel
    } else if draw < 8 {
        TxnKind::Delivery
    } else if draw < 12 {
        TxnKind::OrderStatus
    } else if draw < 55 {
        TxnKind::Payment
    } else {
        TxnKind::NewOrder
    }
}

#[derive(Debug)]
struct TxnStats {
    successful: u64,
    failed: u64,
    total_latency: f64,
    latencies: LatencyReservoir,
}

impl TxnStats {
    fn new() -> Self {
        Self {
            successful: 0,
            failed: 0,
            total_latency: 0.0,
            latencies: LatencyReservoir::new(LATENCIES_STORED),
        }
    }

    fn update(&mut self, committed: bool, latency_secs: f64) {
        if committed {
            self.successful += 1;
            self.total_latency += latency_secs;
            self.latencies.record(latency_secs);
        } else {
            self.failed += 1;
        }
    }

    fn mean_latency(&self) -> f64 {
        if self.successful == 0 {
            0.0
        } else {
            self.total_latency / self.successful as f64
        }
    }
}

#[derive(Debug)]
struct TpccMetrics {
    stock_level: TxnStats,
    delivery: TxnStats,
    order_status: TxnStats,
    payment: TxnStats,
    new_order: TxnStats,
}

impl TpccMetrics {
    fn new() -> Self {
        Self {
            stock_level: TxnStats::new(),
            delivery: TxnStats::new(),
            order_status: TxnStats::new(),
            payment: TxnStats::new(),
            new_order: TxnStats::new(),
        }
    }

    fn stats_mut(&mut self, kind: TxnKind) -> &mut TxnStats {
        match kind {
            TxnKind::StockLevel => &mut self.stock_level,
            TxnKind::Delivery => &mut self.delivery,
            TxnKind::OrderStatus => &mut self.order_status,
            TxnKind::Payment => &mut self.payment,
            TxnKind::NewOrder => &mut self.new_order,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TpccConfig {
    warehouses: usize,
    client_processes_used: usize,
    warehouses_per_client: usize,
    clients_per_warehouse: usize,
    /// Percent chance an order line is supplied by a remote warehouse.
    remote_probability: u64,
    expected_transactions_per_minute: u64,
    test_duration: Duration,
    warmup: Duration,
    customers_per_district: usize,
    items_count: usize,
    client_id: usize,
    client_count: usize,
    shared_random: u64,
}

#[derive(Debug)]
struct TpccState {
    metrics: Mutex<TpccMetrics>,
    global: Mutex<Option<GlobalState>>,
    start_time: Mutex<Option<Instant>>,
}

/// Shared core of the workload; cloned into every emulated-user task.
#[derive(Debug, Clone)]
struct TpccClient {
    cfg: TpccConfig,
    state: Arc<TpccState>,
}

#[derive(Debug)]
pub struct TpccWorkload {
    client: TpccClient,
}

pub fn construct(ctx: &mut WorkloadContext) -> HarnessResult<Box<dyn Workload>> {
    Ok(Box::new(TpccWorkload::from_context(ctx)?))
}

impl TpccWorkload {
    fn from_context(ctx: &mut WorkloadContext) -> HarnessResult<Self> {
        let warehouses = ctx.options.take_usize("warehousesNum", 16)?;
        let clients_used = ctx.options.take_usize("clientsUsed", 16)?;
        let client_processes_used = ctx.options.take_usize("clientProcessesUsed", 8)?;
        let remote_probability = ctx.options.take_u64("remoteProbability", 1)?;
        let expected_transactions_per_minute =
            ctx.options.take_u64("expectedTransactionsPerMinute", 1)?;
        let test_duration = ctx.options.take_u64("testDuration", 300)?;
        let warmup = ctx.options.take_u64("warmupTime", 60)?;
        let customers_per_district = ctx.options.take_usize("customersPerDistrict", 3000)?;
        let items_count = ctx.options.take_usize("itemsNum", 100_000)?;

        if warehouses == 0 || client_processes_used == 0 {
            return Err(HarnessError::SpecInvalid(
                "warehousesNum and clientProcessesUsed must be positive".to_string(),
            ));
        }
        if customers_per_district == 0 || items_count == 0 {
            return Err(HarnessError::SpecInvalid(
                "customersPerDistrict and itemsNum must be positive".to_string(),
            ));
        }

        let cfg = TpccConfig {
            warehouses,
            client_processes_used,
            warehouses_per_client: warehouses / client_processes_used,
            clients_per_warehouse: clients_used / warehouses,
            remote_probability,
            expected_transactions_per_minute,
            test_duration: Duration::from_secs(test_duration),
            warmup: Duration::from_secs(warmup),
            customers_per_district,
            items_count,
            client_id: ctx.client_id,
            client_count: ctx.client_count,
            shared_random: ctx.shared_random,
        };
        Ok(Self {
            client: TpccClient {
                cfg,
                state: Arc::new(TpccState {
                    metrics: Mutex::new(TpccMetrics::new()),
                    global: Mutex::new(None),
                    start_time: Mutex::new(None),
                }),
            },
        })
    }
}

/// Contiguous warehouse range `[start, end)` for one client process,
/// spreading the remainder over the first processes so the partition is
/// as even as possible.
fn warehouse_range(
    warehouses: usize,
    warehouses_per_client: usize,
    client_processes_used: usize,
    client_id: usize,
) -> (usize, usize) {
    let remain = warehouses - warehouses_per_client * client_processes_used;
    if client_id < remain {
        let start = client_id * (warehouses_per_client + 1);
        (start, start + warehouses_per_client + 1)
    } else {
        let start = remain * (warehouses_per_client + 1)
            + (client_id - remain) * warehouses_per_client;
        (start, start + warehouses_per_client)
    }
}

impl TpccClient {
    fn lock_metrics(&self) -> MutexGuard<'_, TpccMetrics> {
        self.state
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transactions_per_minute(&self) -> f64 {
        let denominator =
            self.cfg.test_duration.as_secs_f64() - 2.0 * self.cfg.warmup.as_secs_f64();
        if denominator <= 0.0 {
            return 0.0;
        }
        self.lock_metrics().new_order.successful as f64 * 60.0 / denominator
    }

    /// Wait for the shared global state to appear, then cache it.
    async fn read_global_state(&self, db: &Db) -> HarnessResult<GlobalState> {
        let cached = self
            .state
            .global
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(global) = cached {
            return Ok(global);
        }
        loop {
            let mut tr = db.begin().await.map_err(HarnessError::from)?;
            match read_entity::<GlobalState>(tr.as_mut(), &global_state_key()).await {
                Ok(Some(global)) => {
                    *self.state.global.lock().unwrap_or_else(|p| p.into_inner()) =
                        Some(global.clone());
                    return Ok(global);
                }
                Ok(None) => sleep(GLOBAL_STATE_POLL).await,
                Err(err) => {
                    tr.on_error(err).await.map_err(HarnessError::from)?;
                }
            }
        }
    }

    /// Seed the schema: shared constants, items, then per-warehouse rows.
    async fn populate(&self, db: &Db) -> Result<(), DbError> {
        let cfg = &self.cfg;
        let mut rng = StdRng::seed_from_u64(cfg.shared_random);
        let global = GlobalState {
            c_run: rng.gen_range(0..1024),
            c_load: rng.gen_range(0..1024),
            customers_per_district: cfg.customers_per_district,
            items_count: cfg.items_count,
        };

        let mut batch: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(POPULATE_BATCH);
        for i in 0..cfg.items_count {
            let item = Item {
                i_id: i,
                i_name: format!("Item{i}"),
                i_price: rng.gen_range(1.0..100.0),
            };
            batch.push((item_key(i), encode(&item)));
            flush_if_full(db, &mut batch).await?;
        }

        for w in 0..cfg.warehouses {
            let warehouse = Warehouse {
                w_id: w,
                w_name: format!("Warehouse{w}"),
                w_ytd: 300_000.0,
            };
            batch.push((warehouse_key(w), encode(&warehouse)));
            for d in 0..DISTRICTS_PER_WAREHOUSE {
                let district = District {
                    d_w_id: w,
                    d_id: d,
                    d_name: format!("District{d}"),
                    d_ytd: 30_000.0,
                    d_next_o_id: 0,
                };
                batch.push((district_key(w, d), encode(&district)));
                for c in 0..cfg.customers_per_district {
                    let customer = Customer {
                        c_id: c,
                        c_w_id: w,
                        c_d_id: d,
                        c_first: format!("First{c:08}"),
                        c_last: gen_c_last(c as u64),
                        c_credit: if rng.gen_range(0..100) < 10 { "BC" } else { "GC" }
                            .to_string(),
                        c_balance: -10.0,
                        c_ytd_payment: 10.0,
                        c_payment_cnt: 1,
                        c_delivery_count: 0,
                        c_data: String::new(),
                    };
                    batch.push((
                        customer_index_key(w, d, &customer.c_last, c),
                        customer_key(w, d, c),
                    ));
                    batch.push((customer_key(w, d, c), encode(&customer)));
                    flush_if_full(db, &mut batch).await?;
                }
            }
            for i in 0..cfg.items_count {
                let stock = Stock {
                    s_i_id: i,
                    s_w_id: w,
                    s_quantity: rng.gen_range(10..101),
                    s_ytd: 0,
                    s_order_cnt: 0,
                    s_remote_cnt: 0,
                    s_dist: (0..DISTRICTS_PER_WAREHOUSE)
                        .map(|d| format!("dist-{w:06}-{d:02}-{i:08}"))
                        .collect(),
                };
                batch.push((stock_key(w, i), encode(&stock)));
                flush_if_full(db, &mut batch).await?;
            }
        }

        batch.push((global_state_key(), encode(&global)));
        commit_batch(db, &batch).await?;
        info!(
            warehouses = cfg.warehouses,
            items = cfg.items_count,
            customers_per_district = cfg.customers_per_district,
            "benchmark schema populated"
        );
        Ok(())
    }

    // The five transaction types. Any error fails the attempt; the caller
    // loops until a commit succeeds.

    async fn new_order(&self, db: &Db, global: &GlobalState, w_id: usize) -> bool {
        self.new_order_attempt(db, global, w_id)
            .await
            .unwrap_or(false)
    }

    async fn new_order_attempt(
        &self,
        db: &Db,
        global: &GlobalState,
        w_id: usize,
    ) -> Result<bool, DbError> {
        let cfg = &self.cfg;
        let mut rng = StdRng::from_entropy();
        let d_id = rng.gen_range(0..DISTRICTS_PER_WAREHOUSE);
        let c_id =
            (nurand(&mut rng, global.c_run, 1023, 1, global.customers_per_district as u64) - 1)
                as usize;
        let ol_cnt = rng.gen_range(5..16);
        let will_rollback = rng.gen_range(1..100) == 1;

        let mut tr = db.begin().await?;
        if read_entity::<Warehouse>(tr.as_mut(), &warehouse_key(w_id))
            .await?
            .is_none()
        {
            return Ok(false);
        }
        let Some(mut district) =
            read_entity::<District>(tr.as_mut(), &district_key(w_id, d_id)).await?
        else {
            return Ok(false);
        };
        if read_entity::<Customer>(tr.as_mut(), &customer_key(w_id, d_id, c_id))
            .await?
            .is_none()
        {
            return Ok(false);
        }

        let mut order = Order {
            o_id: district.d_next_o_id,
            o_w_id: w_id,
            o_d_id: d_id,
            o_c_id: c_id,
            o_ol_cnt: ol_cnt,
            o_carrier_id: None,
            o_all_local: true,
            o_entry_d: now_epoch(),
        };
        district.d_next_o_id += 1;
        write_entity(tr.as_mut(), &district_key(w_id, d_id), &district);

        for ol_number in 0..ol_cnt {
            if ol_number + 1 == ol_cnt && will_rollback {
                // Simulated abort: order item not found.
                return Ok(false);
            }
            let i_id =
                (nurand(&mut rng, global.c_run, 8191, 1, global.items_count as u64) - 1) as usize;
            let supply_w_id = if rng.gen_range(0..100) < cfg.remote_probability {
                rng.gen_range(0..cfg.warehouses)
            } else {
                w_id
            };
            let Some(item) = read_entity::<Item>(tr.as_mut(), &item_key(i_id)).await? else {
                return Ok(false);
            };
            let Some(mut stock) =
                read_entity::<Stock>(tr.as_mut(), &stock_key(supply_w_id, i_id)).await?
            else {
                return Ok(false);
            };
            let quantity = rng.gen_range(1..11);
            if stock.s_quantity - quantity >= 10 {
                stock.s_quantity -= quantity;
            } else {
                stock.s_quantity = (stock.s_quantity - quantity) + 91;
            }
            stock.s_ytd += quantity;
            stock.s_order_cnt += 1;
            if supply_w_id != w_id {
                stock.s_remote_cnt += 1;
                order.o_all_local = false;
            }
            write_entity(tr.as_mut(), &stock_key(supply_w_id, i_id), &stock);

            let order_line = OrderLine {
                ol_o_id: order.o_id,
                ol_w_id: w_id,
                ol_d_id: d_id,
                ol_number,
                ol_i_id: i_id,
                ol_supply_w_id: supply_w_id,
                ol_quantity: quantity,
                ol_amount: quantity as f64 * item.i_price,
                ol_dist_info: stock.s_dist.get(d_id).cloned().unwrap_or_default(),
                ol_delivery_d: None,
            };
            write_entity(
                tr.as_mut(),
                &order_line_key(w_id, d_id, order.o_id, ol_number),
                &order_line,
            );
        }

        write_entity(tr.as_mut(), &order_key(w_id, d_id, order.o_id), &order);
        tr.set(
            &order_index_key(w_id, d_id, c_id, order.o_id),
            &order_key(w_id, d_id, order.o_id),
        );
        let new_order = NewOrderRecord {
            no_o_id: order.o_id,
            no_w_id: w_id,
            no_d_id: d_id,
        };
        write_entity(
            tr.as_mut(),
            &new_order_key(w_id, d_id, order.o_id),
            &new_order,
        );
        tr.commit().await?;
        Ok(true)
    }

    /// 60% of lookups go by last name, taking the median-by-first-name
    /// match; the rest go by customer id. 15% cross to a random remote
    /// warehouse and district.
    async fn random_customer(
        &self,
        tr: &mut dyn KvTransaction,
        global: &GlobalState,
        rng: &mut StdRng,
        w_id: usize,
        d_id: usize,
    ) -> Result<Customer, DbError> {
        let mut c_w_id = w_id;
        let mut c_d_id = d_id;
        if rng.gen_range(0..100) >= 85 {
            c_d_id = rng.gen_range(0..DISTRICTS_PER_WAREHOUSE);
            c_w_id = rng.gen_range(0..self.cfg.warehouses);
        }
        if rng.gen_range(0..100) < 60 {
            let last = gen_c_last(
                nurand(rng, global.c_run, 1023, 1, global.customers_per_district as u64) - 1,
            );
            let (begin, end) = customer_index_prefix(c_w_id, c_d_id, &last);
            let index_rows = tr.get_range(&begin, &end, 1000).await?;
            if index_rows.is_empty() {
                return Err(DbError::Failed(format!(
                    "no customer with last name {last}"
                )));
            }
            let mut customers = Vec::with_capacity(index_rows.len());
            for (_, primary_key) in index_rows {
                match read_entity::<Customer>(tr, &primary_key).await? {
                    Some(customer) => customers.push(customer),
                    None => {
                        return Err(DbError::Failed(
                            "dangling customer index entry".to_string(),
                        ))
                    }
                }
            }
            customers.sort_by(|a, b| a.c_first.cmp(&b.c_first));
            let median = customers.len() / 2;
            Ok(customers.swap_remove(median))
        } else {
            let c_id = (nurand(rng, global.c_run, 1023, 1, global.customers_per_district as u64)
                - 1) as usize;
            read_entity::<Customer>(tr, &customer_key(c_w_id, c_d_id, c_id))
                .await?
                .ok_or_else(|| DbError::Failed(format!("missing customer {c_id}")))
        }
    }

    async fn payment(&self, db: &Db, global: &GlobalState, w_id: usize) -> bool {
        self.payment_attempt(db, global, w_id)
            .await
            .unwrap_or(false)
    }

    async fn payment_attempt(
        &self,
        db: &Db,
        global: &GlobalState,
        w_id: usize,
    ) -> Result<bool, DbError> {
        let mut rng = StdRng::from_entropy();
        let d_id = rng.gen_range(0..DISTRICTS_PER_WAREHOUSE);
        let h_amount = rng.gen::<f64>() * 4999.0 + 1.0;

        let mut tr = db.begin().await?;
        let mut customer = self
            .random_customer(tr.as_mut(), global, &mut rng, w_id, d_id)
            .await?;

        let Some(mut warehouse) =
            read_entity::<Warehouse>(tr.as_mut(), &warehouse_key(w_id)).await?
        else {
            return Ok(false);
        };
        warehouse.w_ytd += h_amount;
        write_entity(tr.as_mut(), &warehouse_key(w_id), &warehouse);

        let Some(mut district) =
            read_entity::<District>(tr.as_mut(), &district_key(w_id, d_id)).await?
        else {
            return Ok(false);
        };
        district.d_ytd += h_amount;
        write_entity(tr.as_mut(), &district_key(w_id, d_id), &district);

        customer.c_balance -= h_amount;
        customer.c_ytd_payment += h_amount;
        customer.c_payment_cnt += 1;
        if customer.c_credit == "BC" {
            let entry = format!(
                "{},{},{},{},{}{};",
                customer.c_id, customer.c_d_id, customer.c_w_id, district.d_id, w_id, h_amount
            );
            let mut data = entry + &customer.c_data;
            data.truncate(500);
            customer.c_data = data;
        }
        write_entity(
            tr.as_mut(),
            &customer_key(customer.c_w_id, customer.c_d_id, customer.c_id),
            &customer,
        );

        let history = History {
            h_c_id: customer.c_id,
            h_c_d_id: customer.c_d_id,
            h_c_w_id: customer.c_w_id,
            h_d_id: d_id,
            h_w_id: w_id,
            h_amount,
            h_date: now_epoch(),
            h_data: format!("{}    {}", warehouse.w_name, district.d_name),
        };
        write_entity(tr.as_mut(), &history_key(Uuid::new_v4()), &history);
        tr.commit().await?;
        Ok(true)
    }

    async fn order_status(&self, db: &Db, global: &GlobalState, w_id: usize) -> bool {
        self.order_status_attempt(db, global, w_id)
            .await
            .unwrap_or(false)
    }

    async fn order_status_attempt(
        &self,
        db: &Db,
        global: &GlobalState,
        w_id: usize,
    ) -> Result<bool, DbError> {
        let mut rng = StdRng::from_entropy();
        let d_id = rng.gen_range(0..DISTRICTS_PER_WAREHOUSE);

        let mut tr = db.begin().await?;
        let customer = self
            .random_customer(tr.as_mut(), global, &mut rng, w_id, d_id)
            .await?;

        let (begin, end) = order_index_prefix(customer.c_w_id, customer.c_d_id, customer.c_id);
        let index_rows = tr.get_range(&begin, &end, 1000).await?;
        let Some((_, primary_key)) = index_rows.last() else {
            return Ok(false);
        };
        let Some(order) = read_entity::<Order>(tr.as_mut(), primary_key).await? else {
            return Ok(false);
        };
        for ol_number in 0..order.o_ol_cnt {
            let key = order_line_key(order.o_w_id, order.o_d_id, order.o_id, ol_number);
            if read_entity::<OrderLine>(tr.as_mut(), &key).await?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn delivery(&self, db: &Db, w_id: usize) -> bool {
        self.delivery_attempt(db, w_id).await.unwrap_or(false)
    }

    async fn delivery_attempt(&self, db: &Db, w_id: usize) -> Result<bool, DbError> {
        let mut rng = StdRng::from_entropy();
        let carrier_id = rng.gen_range(0..10);

        let mut tr = db.begin().await?;
        for d_id in 0..DISTRICTS_PER_WAREHOUSE {
            let (begin, end) = new_order_prefix(w_id, d_id);
            let pending = tr.get_range(&begin, &end, 1).await?;
            let Some((new_order_key_bytes, new_order_bytes)) = pending.into_iter().next() else {
                continue;
            };
            let new_order: NewOrderRecord = decode(&new_order_bytes)?;
            tr.clear(&new_order_key_bytes);

            let Some(mut order) =
                read_entity::<Order>(tr.as_mut(), &order_key(w_id, d_id, new_order.no_o_id))
                    .await?
            else {
                return Ok(false);
            };
            order.o_carrier_id = Some(carrier_id);
            write_entity(
                tr.as_mut(),
                &order_key(w_id, d_id, new_order.no_o_id),
                &order,
            );

            let mut amount_sum = 0.0;
            for ol_number in 0..order.o_ol_cnt {
                let key = order_line_key(w_id, d_id, order.o_id, ol_number);
                let Some(order_line) = read_entity::<OrderLine>(tr.as_mut(), &key).await? else {
                    return Ok(false);
                };
                amount_sum += order_line.ol_amount;
            }

            let Some(mut customer) =
                read_entity::<Customer>(tr.as_mut(), &customer_key(w_id, d_id, order.o_c_id))
                    .await?
            else {
                return Ok(false);
            };
            customer.c_balance += amount_sum;
            customer.c_delivery_count += 1;
            write_entity(
                tr.as_mut(),
                &customer_key(w_id, d_id, order.o_c_id),
                &customer,
            );
        }
        tr.commit().await?;
        Ok(true)
    }

    async fn stock_level(&self, db: &Db, w_id: usize, d_id: usize) -> bool {
        self.stock_level_attempt(db, w_id, d_id)
            .await
            .unwrap_or(false)
    }

    async fn stock_level_attempt(
        &self,
        db: &Db,
        w_id: usize,
        d_id: usize,
    ) -> Result<bool, DbError> {
        let mut rng = StdRng::from_entropy();
        let threshold = rng.gen_range(10..21);

        let mut tr = db.begin().await?;
        let Some(district) =
            read_entity::<District>(tr.as_mut(), &district_key(w_id, d_id)).await?
        else {
            return Ok(false);
        };
        let mut low_stock = 0u64;
        let first_order = district.d_next_o_id.saturating_sub(20);
        for o_id in first_order..district.d_next_o_id {
            let (begin, end) = order_line_prefix(w_id, d_id, o_id);
            let lines = tr.get_range(&begin, &end, usize::MAX).await?;
            for (_, line_bytes) in lines {
                let order_line: OrderLine = decode(&line_bytes)?;
                let Some(stock) = read_entity::<Stock>(
                    tr.as_mut(),
                    &stock_key(order_line.ol_w_id, order_line.ol_i_id),
                )
                .await?
                else {
                    return Ok(false);
                };
                if stock.s_quantity < threshold {
                    low_stock += 1;
                }
            }
        }
        debug!(
            warehouse = w_id,
            district = d_id,
            low_stock,
            "stock level scan complete"
        );
        Ok(true)
    }

    fn record_window(&self) -> bool {
        let started = *self
            .state
            .start_time
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let Some(started) = started else {
            return false;
        };
        let elapsed = started.elapsed();
        elapsed > self.cfg.warmup
            && elapsed < self.cfg.test_duration.saturating_sub(self.cfg.warmup)
    }

    /// One emulated terminal: staggered start, then an endless stream of
    /// randomly mixed transactions, each retried until it commits.
    async fn emulated_user(self, db: Db, global: GlobalState, w_id: usize, d_id: usize) {
        let mut rng = StdRng::from_entropy();
        sleep(Duration::from_secs_f64(20.0 * rng.gen::<f64>())).await;
        info!(warehouse = w_id, district = d_id, "starting emulated user");
        loop {
            let kind = txn_kind_for(rng.gen_range(0..100));
            let started = Instant::now();
            loop {
                let committed = match kind {
                    TxnKind::StockLevel => self.stock_level(&db, w_id, d_id).await,
                    TxnKind::Delivery => self.delivery(&db, w_id).await,
                    TxnKind::OrderStatus => self.order_status(&db, &global, w_id).await,
                    TxnKind::Payment => self.payment(&db, &global, w_id).await,
                    TxnKind::NewOrder => self.new_order(&db, &global, w_id).await,
                };
                let latency = started.elapsed().as_secs_f64();
                if self.record_window() {
                    self.lock_metrics().stats_mut(kind).update(committed, latency);
                }
                debug!(
                    transaction = ?kind,
                    latency,
                    success = committed,
                    "transaction complete"
                );
                if committed {
                    break;
                }
            }
        }
    }
}

async fn flush_if_full(db: &Db, batch: &mut Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), DbError> {
    if batch.len() >= POPULATE_BATCH {
        commit_batch(db, batch).await?;
        batch.clear();
    }
    Ok(())
}

async fn commit_batch(db: &Db, writes: &[(Vec<u8>, Vec<u8>)]) -> Result<(), DbError> {
    let mut tr = db.begin().await?;
    loop {
        for (key, value) in writes {
            tr.set(key, value);
        }
        match tr.commit().await {
            Ok(()) => return Ok(()),
            Err(err) => tr.on_error(err).await?,
        }
    }
}

#[async_trait]
impl Workload for TpccWorkload {
    fn description(&self) -> String {
        DESCRIPTION.to_string()
    }

    async fn setup(&self, db: &Db) -> HarnessResult<()> {
        let client = &self.client;
        if client.cfg.client_id == 0 {
            let mut tr = db.begin().await.map_err(HarnessError::from)?;
            let existing = loop {
                match read_entity::<GlobalState>(tr.as_mut(), &global_state_key()).await {
                    Ok(existing) => break existing,
                    Err(err) => tr.on_error(err).await.map_err(HarnessError::from)?,
                }
            };
            drop(tr);
            match existing {
                Some(global) => {
                    *client.state.global.lock().unwrap_or_else(|p| p.into_inner()) = Some(global);
                }
                None => client.populate(db).await.map_err(HarnessError::from)?,
            }
            Ok(())
        } else {
            client.read_global_state(db).await.map(|_| ())
        }
    }

    async fn start(&self, db: &Db) -> HarnessResult<()> {
        let client = &self.client;
        if client.cfg.client_id >= client.cfg.client_processes_used {
            return Ok(());
        }
        let global = client.read_global_state(db).await?;
        *client
            .state
            .start_time
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());

        let (start_wid, end_wid) = warehouse_range(
            client.cfg.warehouses,
            client.cfg.warehouses_per_client,
            client.cfg.client_processes_used,
            client.cfg.client_id,
        );
        info!(
            warehouses = client.cfg.warehouses,
            client_processes_used = client.cfg.client_processes_used,
            client_id = client.cfg.client_id,
            start_wid,
            end_wid,
            "starting benchmark client process"
        );

        let mut users = Vec::new();
        let mut district_counter = 0usize;
        for w_id in start_wid..end_wid {
            for _ in 0..client.cfg.clients_per_warehouse {
                let user = client.clone().emulated_user(
                    db.clone(),
                    global.clone(),
                    w_id,
                    district_counter % DISTRICTS_PER_WAREHOUSE,
                );
                district_counter += 1;
                let duration = client.cfg.test_duration;
                users.push(tokio::spawn(async move {
                    let _ = timeout(duration, user).await;
                }));
            }
        }
        for user in users {
            let _ = user.await;
        }
        Ok(())
    }

    async fn check(&self, _db: &Db) -> HarnessResult<bool> {
        Ok(self.client.transactions_per_minute()
            > self.client.cfg.expected_transactions_per_minute as f64)
    }

    fn get_metrics(&self, out: &mut Vec<PerfMetric>) {
        let cfg = &self.client.cfg;
        let active = cfg.client_id < cfg.client_processes_used;
        let multiplier = cfg.client_count as f64 / cfg.client_processes_used as f64;
        let metrics = self.client.lock_metrics();

        out.push(PerfMetric::new(
            "Transactions Per Minute",
            self.client.transactions_per_minute(),
            false,
        ));

        let per_kind: [(&str, &TxnStats); 5] = [
            ("StockLevel", &metrics.stock_level),
            ("Delivery", &metrics.delivery),
            ("OrderStatus", &metrics.order_status),
            ("Payment", &metrics.payment),
            ("NewOrder", &metrics.new_order),
        ];

        for (name, stats) in &per_kind {
            out.push(PerfMetric::new(
                format!("Successful {name} Transactions"),
                stats.successful as f64,
                false,
            ));
        }
        for (name, stats) in &per_kind {
            out.push(PerfMetric::new(
                format!("Failed {name} Transactions"),
                stats.failed as f64,
                false,
            ));
        }
        for (name, stats) in &per_kind {
            let mean = if active {
                multiplier * stats.mean_latency()
            } else {
                0.0
            };
            out.push(PerfMetric::new(format!("Mean {name} Latency"), mean, true));
        }
        for (name, stats) in &per_kind {
            out.push(PerfMetric::new(
                format!("Median {name} Latency"),
                multiplier * stats.latencies.median(),
                true,
            ));
        }
        for (name, stats) in &per_kind {
            out.push(PerfMetric::new(
                format!("90th Percentile {name} Latency"),
                multiplier * stats.latencies.p90(),
                true,
            ));
        }
        for (name, stats) in &per_kind {
            out.push(PerfMetric::new(
                format!("99th Percentile {name} Latency"),
                multiplier * stats.latencies.p99(),
                true,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDb;
    use crate::options::OptionBlock;
    use proptest::prelude::*;

    fn tiny_workload(client_id: usize) -> TpccWorkload {
        let mut options = OptionBlock::new();
        options.push("warehousesNum", "2");
        options.push("clientsUsed", "2");
        options.push("clientProcessesUsed", "1");
        options.push("customersPerDistrict", "30");
        options.push("itemsNum", "50");
        options.push("testDuration", "10");
        options.push("warmupTime", "1");
        let mut ctx = WorkloadContext {
            client_id,
            client_count: 1,
            shared_random: 7,
            options,
        };
        let workload = TpccWorkload::from_context(&mut ctx).unwrap();
        ctx.options.check_all_consumed().unwrap();
        workload
    }

    #[test]
    fn nurand_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..1000 {
            let v = nurand(&mut rng, 7, 1023, 1, 3000);
            assert!((1..=3000).contains(&v));
        }
    }

    #[test]
    fn c_last_uses_three_syllables() {
        assert_eq!(gen_c_last(0), "BARBARBAR");
        assert_eq!(gen_c_last(371), "PRIANTIOUGHT");
        assert_eq!(gen_c_last(999), "EINGEINGEING");
        // Only the three low digits matter.
        assert_eq!(gen_c_last(2345), gen_c_last(345));
    }

    #[test]
    fn transaction_mix_thresholds() {
        assert_eq!(txn_kind_for(0), TxnKind::StockLevel);
        assert_eq!(txn_kind_for(3), TxnKind::StockLevel);
        assert_eq!(txn_kind_for(4), TxnKind::Delivery);
        assert_eq!(txn_kind_for(7), TxnKind::Delivery);
        assert_eq!(txn_kind_for(8), TxnKind::OrderStatus);
        assert_eq!(txn_kind_for(11), TxnKind::OrderStatus);
        assert_eq!(txn_kind_for(12), TxnKind::Payment);
        assert_eq!(txn_kind_for(54), TxnKind::Payment);
        assert_eq!(txn_kind_for(55), TxnKind::NewOrder);
        assert_eq!(txn_kind_for(99), TxnKind::NewOrder);
    }

    #[test]
    fn entity_blob_round_trip_is_versioned() {
        let district = District {
            d_w_id: 1,
            d_id: 2,
            d_name: "District2".to_string(),
            d_ytd: 30_000.0,
            d_next_o_id: 17,
        };
        let bytes = encode(&district);
        assert_eq!(bytes[0], BLOB_VERSION);
        let decoded: District = decode(&bytes).unwrap();
        assert_eq!(decoded, district);

        let mut wrong_version = bytes.clone();
        wrong_version[0] = 99;
        assert!(decode::<District>(&wrong_version).is_err());
    }

    proptest! {
        #[test]
        fn warehouse_partition_covers_exactly_once(
            warehouses in 1usize..100,
            processes in 1usize..20,
        ) {
            let per_client = warehouses / processes;
            let mut covered = vec![0usize; warehouses];
            let mut previous_end = 0usize;
            for client in 0..processes {
                let (start, end) = warehouse_range(warehouses, per_client, processes, client);
                prop_assert_eq!(start, previous_end);
                previous_end = end;
                for w in start..end {
                    covered[w] += 1;
                }
                // Partition is as even as possible.
                prop_assert!(end - start == per_client || end - start == per_client + 1);
            }
            prop_assert_eq!(previous_end, warehouses);
            prop_assert!(covered.iter().all(|&count| count == 1));
        }
    }

    #[tokio::test]
    async fn setup_populates_once_and_is_idempotent() {
        let (db, handle) = MemoryDb::shared();
        let workload = tiny_workload(0);
        workload.setup(&db).await.unwrap();
        let populated = handle.len();
        assert!(populated > 0);

        workload.setup(&db).await.unwrap();
        assert_eq!(handle.len(), populated);
    }

    #[tokio::test]
    async fn new_order_advances_district_order_counter() {
        let (db, _handle) = MemoryDb::shared();
        let workload = tiny_workload(0);
        workload.setup(&db).await.unwrap();
        let client = &workload.client;
        let global = client.read_global_state(&db).await.unwrap();

        let mut committed = 0;
        for _ in 0..20 {
            if client.new_order(&db, &global, 0).await {
                committed += 1;
            }
        }
        assert!(committed > 0, "some new-order transactions should commit");

        let mut tr = db.begin().await.unwrap();
        let mut next_o_id_sum = 0;
        for d in 0..DISTRICTS_PER_WAREHOUSE {
            let district: District = read_entity(tr.as_mut(), &district_key(0, d))
                .await
                .unwrap()
                .unwrap();
            next_o_id_sum += district.d_next_o_id;
        }
        assert_eq!(next_o_id_sum, committed);
    }

    #[tokio::test]
    async fn full_transaction_mix_runs_against_populated_schema() {
        let (db, _handle) = MemoryDb::shared();
        let workload = tiny_workload(0);
        workload.setup(&db).await.unwrap();
        let client = &workload.client;
        let global = client.read_global_state(&db).await.unwrap();

        let mut new_orders = 0;
        while new_orders < 5 {
            if client.new_order(&db, &global, 1).await {
                new_orders += 1;
            }
        }
        let mut payments = 0;
        while payments < 3 {
            if client.payment(&db, &global, 1).await {
                payments += 1;
            }
        }
        assert!(client.delivery(&db, 1).await);
        assert!(client.stock_level(&db, 1, 0).await);
    }

    #[tokio::test]
    async fn check_compares_tpm_to_expectation() {
        let workload = tiny_workload(0);
        let (db, _) = MemoryDb::shared();
        // No successful new orders: tpm is 0, below the expected 1.
        assert!(!workload.check(&db).await.unwrap());

        workload.client.lock_metrics().new_order.successful = 1000;
        // duration 10s, warmup 1s: tpm = 1000 * 60 / 8.
        assert!(workload.check(&db).await.unwrap());
    }

    #[tokio::test]
    async fn clients_beyond_process_count_idle_through_start() {
        let (db, handle) = MemoryDb::shared();
        // clientProcessesUsed is 1, so client 1 does not run users.
        let workload = tiny_workload(1);
        workload.start(&db).await.unwrap();
        assert!(handle.is_empty());
    }

    #[test]
    fn metrics_cover_every_transaction_type() {
        let workload = tiny_workload(0);
        {
            let mut metrics = workload.client.lock_metrics();
            metrics.new_order.update(true, 0.5);
            metrics.payment.update(false, 0.1);
        }
        let mut out = Vec::new();
        workload.get_metrics(&mut out);
        let names: Vec<&str> = out.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"Transactions Per Minute"));
        for kind in ["StockLevel", "Delivery", "OrderStatus", "Payment", "NewOrder"] {
            assert!(names.contains(&format!("Successful {kind} Transactions").as_str()));
            assert!(names.contains(&format!("Failed {kind} Transactions").as_str()));
            assert!(names.contains(&format!("Mean {kind} Latency").as_str()));
            assert!(names.contains(&format!("Median {kind} Latency").as_str()));
            assert!(names.contains(&format!("90th Percentile {kind} Latency").as_str()));
            assert!(names.contains(&format!("99th Percentile {kind} Latency").as_str()));
        }
        let succeeded = out
            .iter()
            .find(|m| m.name == "Successful NewOrder Transactions")
            .unwrap();
        assert_eq!(succeeded.value, 1.0);
    }
}
