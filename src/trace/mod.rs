//! Dynamic call tracing
//!
//! A [`TraceTarget`] runs the program and reports raw call/return events.
//! The [`Tracer`] keeps a frame stack, maps in-root frames to indexed
//! symbols by file and line, and persists one event per call between two
//! in-root symbols. Frames outside the root are kept on the stack so
//! returns stay balanced, but never produce events.

use crate::db::{Db, StoredSymbol, TraceEventInput};
use crate::error::{Error, Result};
use crate::model::{SymbolKind, TraceRun, TraceStatus};
use crate::util;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub mod python;

pub use python::PythonTarget;

/// Events buffered before they are written to the store.
const FLUSH_EVERY: usize = 1_000;

/// What to run under the tracer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEntry {
    /// `pkg.mod:func`: import the module and call the function with the args.
    Function { module: String, function: String },
    /// `pkg.mod`: run the module as `__main__`.
    Module(String),
    /// A script path, run as `__main__`.
    Script(String),
}

impl TraceEntry {
    /// Parse a `--module` value: `pkg.mod:func` or `pkg.mod`.
    pub fn module(value: &str) -> Self {
        match value.split_once(':') {
            Some((module, function)) if !function.is_empty() => TraceEntry::Function {
                module: module.to_string(),
                function: function.to_string(),
            },
            _ => TraceEntry::Module(value.trim_end_matches(':').to_string()),
        }
    }

    pub fn script(path: impl Into<String>) -> Self {
        TraceEntry::Script(path.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TraceEntry::Function { .. } => "function",
            TraceEntry::Module(_) => "module",
            TraceEntry::Script(_) => "script",
        }
    }
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEntry::Function { module, function } => write!(f, "{module}:{function}"),
            TraceEntry::Module(module) => f.write_str(module),
            TraceEntry::Script(path) => f.write_str(path),
        }
    }
}

/// One event reported by a running target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "e", rename_all = "lowercase")]
pub enum RawEvent {
    Call {
        #[serde(rename = "f")]
        file: String,
        /// First line of the called code object.
        #[serde(rename = "l")]
        line: i64,
        #[serde(rename = "n")]
        name: String,
        #[serde(rename = "t")]
        offset_ns: i64,
    },
    /// A suspended generator or coroutine frame continues. Its frame is
    /// back on the stack, but nothing new was called.
    Resume {
        #[serde(rename = "f")]
        file: String,
        #[serde(rename = "l")]
        line: i64,
        #[serde(rename = "n")]
        name: String,
    },
    Return,
    Error {
        #[serde(rename = "msg")]
        message: String,
    },
}

impl RawEvent {
    pub fn call(file: impl Into<String>, line: i64, name: impl Into<String>, offset_ns: i64) -> Self {
        RawEvent::Call {
            file: file.into(),
            line,
            name: name.into(),
            offset_ns,
        }
    }

    pub fn resume(file: impl Into<String>, line: i64, name: impl Into<String>) -> Self {
        RawEvent::Resume {
            file: file.into(),
            line,
            name: name.into(),
        }
    }
}

/// How a target finished when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetExit {
    Completed,
    Cancelled,
}

/// Receives events as the target produces them.
pub type EventSink<'a> = dyn FnMut(RawEvent) -> Result<()> + 'a;

pub trait TraceTarget {
    /// Run `entry` with `root` as working directory. Events go to `sink` in
    /// order. A failing target returns `Error::TraceTarget` after every
    /// event it produced has been delivered. Implementations poll `stop`
    /// and return `TargetExit::Cancelled` once it fires.
    fn run(
        &mut self,
        root: &Path,
        entry: &TraceEntry,
        args: &[String],
        stop: &StopHandle,
        sink: &mut EventSink<'_>,
    ) -> Result<TargetExit>;
}

/// Cooperative cancellation shared between the caller and the target.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also stop once `timeout` has elapsed from now.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|timeout| Instant::now() + timeout);
        self
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Debug, Clone)]
struct Frame {
    in_root: bool,
    /// Lambdas and comprehensions: attributed to the enclosing frame.
    transparent: bool,
    symbol: Option<String>,
}

/// Turns raw events into attributed trace events.
struct Ingestor<'a> {
    db: &'a Db,
    root: PathBuf,
    stack: Vec<Frame>,
    paths: HashMap<String, Option<String>>,
    spans: HashMap<String, Vec<StoredSymbol>>,
    seq: i64,
    pending: Vec<TraceEventInput>,
    run_id: i64,
    written: usize,
    error: Option<String>,
}

impl<'a> Ingestor<'a> {
    fn new(db: &'a Db, root: &Path, run_id: i64) -> Self {
        Self {
            db,
            root: root.to_path_buf(),
            stack: Vec::new(),
            paths: HashMap::new(),
            spans: HashMap::new(),
            seq: 0,
            pending: Vec::new(),
            run_id,
            written: 0,
            error: None,
        }
    }

    fn push(&mut self, event: RawEvent) -> Result<()> {
        match event {
            RawEvent::Call {
                file,
                line,
                name,
                offset_ns,
            } => self.on_call(&file, line, &name, Some(offset_ns))?,
            RawEvent::Resume { file, line, name } => self.on_call(&file, line, &name, None)?,
            RawEvent::Return => {
                self.stack.pop();
            }
            RawEvent::Error { message } => self.error = Some(message),
        }
        if self.pending.len() >= FLUSH_EVERY {
            self.flush()?;
        }
        Ok(())
    }

    /// `offset_ns` is `None` for a resumed frame, which is stacked but not
    /// recorded again.
    fn on_call(&mut self, file: &str, line: i64, name: &str, offset_ns: Option<i64>) -> Result<()> {
        let Some(rel_path) = self.rel_path(file)? else {
            self.stack.push(Frame {
                in_root: false,
                transparent: false,
                symbol: None,
            });
            return Ok(());
        };
        let ancestor = self.stack.iter().rev().find(|frame| frame.in_root).cloned();
        if is_anonymous(name) {
            self.stack.push(Frame {
                in_root: true,
                transparent: true,
                symbol: ancestor.and_then(|frame| frame.symbol),
            });
            return Ok(());
        }
        let symbol = self.lookup(&rel_path, line, name);
        // Module bodies run on import; they attribute calls but are not callees.
        let recordable = name != "<module>";
        if let (true, Some(ancestor), Some(callee), Some(offset_ns)) =
            (recordable, ancestor, symbol.as_ref(), offset_ns)
        {
            let depth = self
                .stack
                .iter()
                .filter(|frame| frame.in_root && !frame.transparent)
                .count() as i64;
            self.seq += 1;
            self.pending.push(TraceEventInput {
                seq: self.seq,
                caller_qualname: ancestor.symbol,
                callee_qualname: callee.clone(),
                depth,
                offset_ns,
            });
        }
        self.stack.push(Frame {
            in_root: true,
            transparent: false,
            symbol,
        });
        Ok(())
    }

    /// Root-relative path of an indexed file, or `None` for anything else.
    fn rel_path(&mut self, file: &str) -> Result<Option<String>> {
        if let Some(cached) = self.paths.get(file) {
            return Ok(cached.clone());
        }
        let path = Path::new(file);
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let rel = std::fs::canonicalize(&absolute)
            .ok()
            .and_then(|canonical| util::normalize_rel_path(&self.root, &canonical));
        let rel = match rel {
            Some(rel) => {
                let symbols = self.db.symbols_for_path(&rel)?;
                if symbols.is_empty() {
                    None
                } else {
                    self.spans.insert(rel.clone(), symbols);
                    Some(rel)
                }
            }
            None => None,
        };
        self.paths.insert(file.to_string(), rel.clone());
        Ok(rel)
    }

    /// Innermost symbol containing `line` whose name matches the code
    /// object; `<module>` maps to the module symbol.
    fn lookup(&self, rel_path: &str, line: i64, name: &str) -> Option<String> {
        let symbols = self.spans.get(rel_path)?;
        if name == "<module>" {
            return symbols
                .iter()
                .find(|symbol| symbol.kind == SymbolKind::Module)
                .map(|symbol| symbol.qualname.clone());
        }
        let containing = || {
            symbols.iter().filter(move |symbol| {
                symbol.kind != SymbolKind::Module
                    && symbol.start_line <= line
                    && line <= symbol.end_line
            })
        };
        let innermost = |a: &&StoredSymbol, b: &&StoredSymbol| {
            (a.end_line - a.start_line)
                .cmp(&(b.end_line - b.start_line))
                .then(b.start_line.cmp(&a.start_line))
        };
        containing()
            .filter(|symbol| symbol.name == name)
            .min_by(innermost)
            .or_else(|| containing().min_by(innermost))
            .map(|symbol| symbol.qualname.clone())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let events = std::mem::take(&mut self.pending);
        self.written += self.db.insert_trace_events(self.run_id, &events)?;
        Ok(())
    }
}

fn is_anonymous(name: &str) -> bool {
    name.starts_with('<') && name != "<module>"
}

pub struct Tracer<'a> {
    db: &'a Db,
    root: PathBuf,
}

impl<'a> Tracer<'a> {
    pub fn new(db: &'a Db, root: &Path) -> Self {
        Self {
            db,
            root: root.to_path_buf(),
        }
    }

    /// Run `target` and persist its call events under a new trace run.
    /// Events gathered before a failure or cancellation are kept.
    pub fn trace(
        &self,
        target: &mut dyn TraceTarget,
        entry: &TraceEntry,
        args: &[String],
        stop: &StopHandle,
    ) -> Result<TraceRun> {
        let entry_label = entry.to_string();
        let run_id = self
            .db
            .begin_trace_run(&entry_label, args, util::now_secs())?;
        tracing::info!("trace run {run_id} started for {entry_label}");

        let mut ingestor = Ingestor::new(self.db, &self.root, run_id);
        let outcome = {
            let mut sink = |event: RawEvent| ingestor.push(event);
            target.run(&self.root, entry, args, stop, &mut sink)
        };
        let flushed = ingestor.flush();

        let (status, error) = match &outcome {
            Ok(TargetExit::Completed) => match &ingestor.error {
                Some(message) => (TraceStatus::Failed, Some(message.clone())),
                None => (TraceStatus::Completed, None),
            },
            Ok(TargetExit::Cancelled) => (TraceStatus::Cancelled, Some("cancelled".to_string())),
            Err(err) => (TraceStatus::Failed, Some(err.to_string())),
        };
        if let Err(err) = &flushed {
            tracing::warn!("trace run {run_id}: failed to persist events: {err}");
        }
        self.db
            .finish_trace_run(run_id, status, error.as_deref(), util::now_secs())?;
        tracing::info!(
            "trace run {run_id} {}: {} events",
            status.as_str(),
            ingestor.written
        );

        outcome?;
        flushed?;
        self.db
            .get_trace_run(run_id)?
            .ok_or_else(|| Error::TraceTarget {
                entry: entry_label,
                message: format!("trace run {run_id} vanished"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_forms() {
        assert_eq!(
            TraceEntry::module("pkg.mod:main"),
            TraceEntry::Function {
                module: "pkg.mod".to_string(),
                function: "main".to_string()
            }
        );
        assert_eq!(TraceEntry::module("pkg.mod"), TraceEntry::Module("pkg.mod".to_string()));
        assert_eq!(TraceEntry::script("run.py").to_string(), "run.py");
        assert_eq!(TraceEntry::module("a:b").kind(), "function");
    }

    #[test]
    fn raw_events_parse_from_wire_lines() {
        let call: RawEvent =
            serde_json::from_str(r#"{"e":"call","f":"/r/a.py","l":3,"n":"f","t":12}"#).unwrap();
        assert_eq!(call, RawEvent::call("/r/a.py", 3, "f", 12));
        let resume: RawEvent =
            serde_json::from_str(r#"{"e":"resume","f":"/r/a.py","l":3,"n":"gen"}"#).unwrap();
        assert_eq!(resume, RawEvent::resume("/r/a.py", 3, "gen"));
        let ret: RawEvent = serde_json::from_str(r#"{"e":"return"}"#).unwrap();
        assert_eq!(ret, RawEvent::Return);
        let err: RawEvent = serde_json::from_str(r#"{"e":"error","msg":"boom"}"#).unwrap();
        assert_eq!(
            err,
            RawEvent::Error {
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn stop_handle_fires_on_flag_or_deadline() {
        let stop = StopHandle::new();
        assert!(!stop.is_stopped());
        stop.clone().stop();
        assert!(stop.is_stopped());
        let expired = StopHandle::new().with_timeout(Some(Duration::from_millis(0)));
        assert!(expired.is_stopped());
    }
}
