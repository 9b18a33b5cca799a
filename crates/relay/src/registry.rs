//! Customer and pipe registry
//!
//! One mutex guards the whole map; every operation holds it for its full
//! duration and never across an await. A customer exists iff it has at least
//! one attached pipe. An address counts as paid while at least one of its
//! pay channels is open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::pipe::PipeStats;

pub type PipeId = u64;

struct PipeEntry {
    target: String,
    is_raw: bool,
    stats: Arc<PipeStats>,
}

struct Customer {
    pipes: HashMap<PipeId, PipeEntry>,
    kill: watch::Sender<bool>,
}

impl Customer {
    fn new() -> Self {
        let (kill, _) = watch::channel(false);
        Self {
            pipes: HashMap::new(),
            kill,
        }
    }
}

#[derive(Default)]
struct Inner {
    customers: HashMap<String, Customer>,
    /// Cumulative bytes relayed per address; outlives individual customers
    /// while a pay channel or a pipe still holds it
    meters: HashMap<String, Arc<AtomicU64>>,
    /// Open pay channels per address
    channels: HashMap<String, usize>,
    next_id: PipeId,
}

/// Handles a pipe receives when it is attached
pub struct Attached {
    pub id: PipeId,
    pub stats: Arc<PipeStats>,
    pub meter: Arc<AtomicU64>,
    pub kill: watch::Receiver<bool>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create-or-get the customer and attach a new pipe, in one step
    pub fn attach(&self, address: &str, target: &str, is_raw: bool) -> Attached {
        attach_locked(&mut self.inner.lock(), address, target, is_raw)
    }

    /// Like [`Registry::attach`], but only while `address` has an open pay
    /// channel. The check and the attach happen under one lock, so a pipe
    /// never slips in after the channel's eviction.
    pub fn attach_paid(&self, address: &str, target: &str, is_raw: bool) -> Option<Attached> {
        let mut inner = self.inner.lock();
        if !inner.channels.contains_key(address) {
            return None;
        }
        Some(attach_locked(&mut inner, address, target, is_raw))
    }

    /// Record an accepted pay channel for `address`
    pub fn open_channel(&self, address: &str) {
        *self
            .inner
            .lock()
            .channels
            .entry(address.to_string())
            .or_insert(0) += 1;
    }

    /// Forget one pay channel of `address`. With `evict` every pipe of the
    /// address is signalled to stop; returns how many were signalled.
    pub fn close_channel(&self, address: &str, evict: bool) -> usize {
        let mut inner = self.inner.lock();
        if let Some(open) = inner.channels.get_mut(address) {
            *open -= 1;
            if *open == 0 {
                inner.channels.remove(address);
            }
        }
        if !evict {
            return 0;
        }
        evict_locked(&inner, address)
    }

    pub fn is_paid(&self, address: &str) -> bool {
        self.inner.lock().channels.contains_key(address)
    }

    /// Detach a pipe. Returns `true` when the customer was removed with it.
    pub fn detach(&self, address: &str, id: PipeId) -> bool {
        let mut inner = self.inner.lock();
        let Some(customer) = inner.customers.get_mut(address) else {
            return false;
        };
        customer.pipes.remove(&id);
        if !customer.pipes.is_empty() {
            return false;
        }

        inner.customers.remove(address);
        prune_meter_locked(&mut inner, address);
        true
    }

    /// Signal every pipe of `address` to stop. Returns how many were signalled.
    pub fn evict(&self, address: &str) -> usize {
        evict_locked(&self.inner.lock(), address)
    }

    /// Usage meter for `address`, created on first use
    pub fn meter(&self, address: &str) -> Arc<AtomicU64> {
        self.inner
            .lock()
            .meters
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Release a meter handle and drop the meter if nothing else uses it
    pub fn release_meter(&self, address: &str, meter: Arc<AtomicU64>) {
        drop(meter);
        let mut inner = self.inner.lock();
        prune_meter_locked(&mut inner, address);
    }

    pub fn usage(&self, address: &str) -> u64 {
        self.inner
            .lock()
            .meters
            .get(address)
            .map(|m| m.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn has_customer(&self, address: &str) -> bool {
        self.inner.lock().customers.contains_key(address)
    }

    pub fn customer_count(&self) -> usize {
        self.inner.lock().customers.len()
    }

    pub fn pipe_count(&self, address: &str) -> usize {
        self.inner
            .lock()
            .customers
            .get(address)
            .map(|c| c.pipes.len())
            .unwrap_or(0)
    }

    /// `(target, is_raw, up, down)` of every pipe of `address`
    pub fn pipes_of(&self, address: &str) -> Vec<(String, bool, u64, u64)> {
        let inner = self.inner.lock();
        let Some(customer) = inner.customers.get(address) else {
            return Vec::new();
        };
        customer
            .pipes
            .values()
            .map(|p| (p.target.clone(), p.is_raw, p.stats.up(), p.stats.down()))
            .collect()
    }
}

fn attach_locked(inner: &mut Inner, address: &str, target: &str, is_raw: bool) -> Attached {
    inner.next_id += 1;
    let id = inner.next_id;

    let meter = inner
        .meters
        .entry(address.to_string())
        .or_insert_with(|| Arc::new(AtomicU64::new(0)))
        .clone();

    let customer = inner
        .customers
        .entry(address.to_string())
        .or_insert_with(Customer::new);
    let stats = Arc::new(PipeStats::new());
    customer.pipes.insert(
        id,
        PipeEntry {
            target: target.to_string(),
            is_raw,
            stats: stats.clone(),
        },
    );

    Attached {
        id,
        stats,
        meter,
        kill: customer.kill.subscribe(),
    }
}

fn evict_locked(inner: &Inner, address: &str) -> usize {
    match inner.customers.get(address) {
        Some(customer) => {
            customer.kill.send_replace(true);
            customer.pipes.len()
        }
        None => 0,
    }
}

fn prune_meter_locked(inner: &mut Inner, address: &str) {
    if inner.customers.contains_key(address) {
        return;
    }
    // Only the map holds it; new handles are handed out under this lock
    if inner
        .meters
        .get(address)
        .is_some_and(|m| Arc::strong_count(m) == 1)
    {
        inner.meters.remove(address);
    }
}
