//! Worker dispatch: one dedicated thread owns all vault state.
//!
//! The public `Vault` handle can be used from any thread; it enqueues
//! requests over a channel and the worker runs them one at a time, so all
//! operations on a vault are totally ordered by submission. Progress, done
//! and error reports travel through an asynchronous event callback invoked
//! on the worker thread. Synchronous queries go through the same queue
//! (with a reply channel), keeping them ordered with the operations.
//!
//! An operation that panics is converted into `error{msg:"unknown"}` — the
//! worker never dies mid-stream.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;

use log::debug;
use serde_json::{Map, Value};

use crate::config::VaultConfig;
use crate::engine::{Engine, MediaAction, MediaPlan};
use crate::error::{Result, VaultError};
use crate::units::Unit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Backup,
    Restore,
    RemoveSnapshot,
    ExportImportPrepare,
    ExportImportExecute,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Backup => "backup",
            Operation::Restore => "restore",
            Operation::RemoveSnapshot => "remove-snapshot",
            Operation::ExportImportPrepare => "export-import-prepare",
            Operation::ExportImportExecute => "export-import-execute",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Progress,
    Done,
    Error,
}

/// One report from a running operation: `{operation, kind, data}`.
#[derive(Debug, Clone)]
pub struct VaultEvent {
    pub operation: Operation,
    pub kind: EventKind,
    pub data: Map<String, Value>,
}

type EventSink = Box<dyn Fn(VaultEvent) + Send + 'static>;

enum Request {
    Op(Op),
    Query(Query),
    Shutdown,
}

enum Op {
    Connect,
    Backup {
        message: String,
        units: Vec<String>,
    },
    Restore {
        snapshot: String,
        units: Vec<String>,
    },
    RemoveSnapshot {
        name: String,
    },
    ExportImportPrepare {
        action: MediaAction,
        path: PathBuf,
    },
    ExportImportExecute,
}

impl Op {
    fn operation(&self) -> Operation {
        match self {
            Op::Connect => Operation::Connect,
            Op::Backup { .. } => Operation::Backup,
            Op::Restore { .. } => Operation::Restore,
            Op::RemoveSnapshot { .. } => Operation::RemoveSnapshot,
            Op::ExportImportPrepare { .. } => Operation::ExportImportPrepare,
            Op::ExportImportExecute => Operation::ExportImportExecute,
        }
    }
}

enum Query {
    Snapshots(mpsc::Sender<Result<Vec<String>>>),
    Notes {
        snapshot: String,
        reply: mpsc::Sender<Result<String>>,
    },
    Units(mpsc::Sender<Result<BTreeMap<String, Unit>>>),
    RegisterUnit {
        data: Map<String, Value>,
        reply: mpsc::Sender<Result<bool>>,
    },
    RemoveUnit {
        name: String,
        reply: mpsc::Sender<Result<bool>>,
    },
    ResetHead(mpsc::Sender<Result<()>>),
}

/// Public handle to a vault. Cheap to call from any thread; all work runs
/// on the vault's worker thread.
pub struct Vault {
    tx: mpsc::Sender<Request>,
    worker: Option<JoinHandle<()>>,
}

impl Vault {
    /// Spawn the worker for a vault rooted at `root`. `on_event` is invoked
    /// on the worker thread for every progress/done/error report.
    pub fn open(
        root: impl Into<PathBuf>,
        home: Option<PathBuf>,
        cfg: VaultConfig,
        on_event: impl Fn(VaultEvent) + Send + 'static,
    ) -> Result<Vault> {
        let root = root.into();
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("vault-worker".to_string())
            .spawn(move || {
                let engine = Engine::new(root, home, cfg);
                worker_loop(engine, rx, Box::new(on_event));
            })
            .map_err(|e| VaultError::io("spawn", Path::new("vault-worker"), e))?;
        Ok(Vault {
            tx,
            worker: Some(worker),
        })
    }

    fn submit(&self, request: Request) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|_| VaultError::state("vault worker stopped"))
    }

    // ----- asynchronous operations (reported through events) -----

    pub fn connect(&self) -> Result<()> {
        self.submit(Request::Op(Op::Connect))
    }

    pub fn start_backup(&self, message: &str, units: &[String]) -> Result<()> {
        self.submit(Request::Op(Op::Backup {
            message: message.to_string(),
            units: units.to_vec(),
        }))
    }

    pub fn start_restore(&self, snapshot: &str, units: &[String]) -> Result<()> {
        self.submit(Request::Op(Op::Restore {
            snapshot: snapshot.to_string(),
            units: units.to_vec(),
        }))
    }

    pub fn remove_snapshot(&self, name: &str) -> Result<()> {
        self.submit(Request::Op(Op::RemoveSnapshot {
            name: name.to_string(),
        }))
    }

    pub fn export_import_prepare(&self, action: MediaAction, path: &Path) -> Result<()> {
        self.submit(Request::Op(Op::ExportImportPrepare {
            action,
            path: path.to_path_buf(),
        }))
    }

    pub fn export_import_execute(&self) -> Result<()> {
        self.submit(Request::Op(Op::ExportImportExecute))
    }

    // ----- synchronous queries (ordered with the operations) -----

    pub fn snapshots(&self) -> Result<Vec<String>> {
        let (tx, rx) = mpsc::channel();
        self.submit(Request::Query(Query::Snapshots(tx)))?;
        recv_reply(rx)
    }

    pub fn notes(&self, snapshot: &str) -> Result<String> {
        let (tx, rx) = mpsc::channel();
        self.submit(Request::Query(Query::Notes {
            snapshot: snapshot.to_string(),
            reply: tx,
        }))?;
        recv_reply(rx)
    }

    pub fn units(&self) -> Result<BTreeMap<String, Unit>> {
        let (tx, rx) = mpsc::channel();
        self.submit(Request::Query(Query::Units(tx)))?;
        recv_reply(rx)
    }

    pub fn register_unit(&self, data: Map<String, Value>) -> Result<bool> {
        let (tx, rx) = mpsc::channel();
        self.submit(Request::Query(Query::RegisterUnit { data, reply: tx }))?;
        recv_reply(rx)
    }

    pub fn remove_unit(&self, name: &str) -> Result<bool> {
        let (tx, rx) = mpsc::channel();
        self.submit(Request::Query(Query::RemoveUnit {
            name: name.to_string(),
            reply: tx,
        }))?;
        recv_reply(rx)
    }

    pub fn reset_head(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.submit(Request::Query(Query::ResetHead(tx)))?;
        recv_reply(rx)
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        let _ = self.tx.send(Request::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn recv_reply<T>(rx: mpsc::Receiver<Result<T>>) -> Result<T> {
    rx.recv()
        .map_err(|_| VaultError::state("vault worker stopped"))?
}

fn worker_loop(mut engine: Engine, rx: mpsc::Receiver<Request>, events: EventSink) {
    debug!("worker: started, root={}", engine.root().display());
    while let Ok(request) = rx.recv() {
        match request {
            Request::Shutdown => break,
            Request::Query(query) => handle_query(&mut engine, query),
            Request::Op(op) => run_op(&mut engine, op, &events),
        }
    }
    debug!("worker: stopped");
}

fn handle_query(engine: &mut Engine, query: Query) {
    match query {
        Query::Snapshots(reply) => {
            let _ = reply.send(engine.snapshots());
        }
        Query::Notes { snapshot, reply } => {
            let _ = reply.send(engine.notes(&snapshot));
        }
        Query::Units(reply) => {
            let _ = reply.send(engine.units());
        }
        Query::RegisterUnit { data, reply } => {
            let _ = reply.send(engine.register_unit(data));
        }
        Query::RemoveUnit { name, reply } => {
            let _ = reply.send(engine.remove_unit(&name));
        }
        Query::ResetHead(reply) => {
            let _ = reply.send(engine.reset_head());
        }
    }
}

fn run_op(engine: &mut Engine, op: Op, events: &EventSink) {
    let operation = op.operation();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut emit = |data: Map<String, Value>| {
            events(VaultEvent {
                operation,
                kind: EventKind::Progress,
                data,
            })
        };
        match op {
            Op::Connect => engine.connect().map(|_| Map::new()),
            Op::Backup { message, units } => engine
                .backup(&message, &units, &mut emit)
                .map(|snapshot| text_map(&[("snapshot", snapshot.as_str())])),
            Op::Restore { snapshot, units } => engine
                .restore(&snapshot, &units, &mut emit)
                .map(|_| text_map(&[("snapshot", snapshot.as_str())])),
            Op::RemoveSnapshot { name } => engine
                .remove_snapshot(&name)
                .map(|_| text_map(&[("snapshot", name.as_str())])),
            Op::ExportImportPrepare { action, path } => engine
                .export_import_prepare(action, &path)
                .map(|plan| plan_map(&plan)),
            Op::ExportImportExecute => {
                engine.export_import_execute().map(|plan| plan_map(&plan))
            }
        }
    }));

    let event = match outcome {
        Ok(Ok(data)) => VaultEvent {
            operation,
            kind: EventKind::Done,
            data,
        },
        Ok(Err(e)) => VaultEvent {
            operation,
            kind: EventKind::Error,
            data: error_map(&e),
        },
        Err(_) => VaultEvent {
            operation,
            kind: EventKind::Error,
            data: text_map(&[("msg", "unknown")]),
        },
    };
    events(event);
}

fn text_map(pairs: &[(&str, &str)]) -> Map<String, Value> {
    let mut data = Map::new();
    for (key, value) in pairs {
        data.insert(key.to_string(), Value::String(value.to_string()));
    }
    data
}

fn error_map(err: &VaultError) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("error".to_string(), Value::String(err.kind().to_string()));
    data.insert("msg".to_string(), Value::String(err.to_string()));
    data
}

fn plan_map(plan: &MediaPlan) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert(
        "action".to_string(),
        Value::String(plan.action.to_string()),
    );
    data.insert(
        "path".to_string(),
        Value::String(plan.path.display().to_string()),
    );
    data.insert("required_bytes".to_string(), plan.required_bytes.into());
    data.insert("available_bytes".to_string(), plan.available_bytes.into());
    data
}
