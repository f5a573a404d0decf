use super::{EventSink, RawEvent, StopHandle, TargetExit, TraceEntry, TraceTarget};
use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Installed in the child interpreter with `-c`. Writes one JSON object per
/// line: `call` (file, first line, code name, ns offset), `return`, and a
/// final `error` when the entry point raises.
const BOOTSTRAP: &str = r#"
import dis, importlib, json, os, runpy, sys, time

def _ttmm_main():
    events_path, kind, entry = sys.argv[1], sys.argv[2], sys.argv[3]
    args = sys.argv[4:]
    sys.path.insert(0, os.getcwd())
    out = open(events_path, "w", buffering=1, encoding="utf-8")
    start = time.perf_counter_ns()

    def emit(record):
        out.write(json.dumps(record) + "\n")

    # Generators, coroutines and async generators report every resume as a
    # call and every suspension as a return.
    gen_flags = 0x20 | 0x80 | 0x200
    yield_ops = {dis.opmap[op] for op in ("YIELD_VALUE", "YIELD_FROM") if op in dis.opmap}
    suspended = {}

    def at_yield(frame):
        try:
            return frame.f_code.co_code[frame.f_lasti] in yield_ops
        except (IndexError, TypeError):
            return False

    def profile(frame, event, arg):
        if event == "call":
            code = frame.f_code
            if code.co_flags & gen_flags:
                lasti = suspended.pop(id(frame), None)
                if lasti is not None and frame.f_lasti >= lasti:
                    emit({"e": "resume", "f": code.co_filename,
                          "l": code.co_firstlineno, "n": code.co_name})
                    return
            emit({"e": "call", "f": code.co_filename, "l": code.co_firstlineno,
                  "n": code.co_name, "t": time.perf_counter_ns() - start})
        elif event == "return":
            if frame.f_code.co_flags & gen_flags and at_yield(frame):
                suspended[id(frame)] = frame.f_lasti
            emit({"e": "return"})

    status = 0
    sys.setprofile(profile)
    try:
        if kind == "function":
            module_name, func_name = entry.split(":", 1)
            sys.argv = [module_name] + args
            target = importlib.import_module(module_name)
            for part in func_name.split("."):
                target = getattr(target, part)
            target(*args)
        elif kind == "module":
            sys.argv = [entry] + args
            runpy.run_module(entry, run_name="__main__", alter_sys=True)
        else:
            sys.argv = [entry] + args
            runpy.run_path(entry, run_name="__main__")
    except SystemExit as exc:
        sys.setprofile(None)
        if exc.code not in (None, 0):
            emit({"e": "error", "msg": "exited with status %r" % (exc.code,)})
            status = 1
    except BaseException as exc:
        sys.setprofile(None)
        emit({"e": "error", "msg": "%s: %s" % (type(exc).__name__, exc)})
        status = 1
    finally:
        sys.setprofile(None)
        out.close()
    sys.exit(status)

_ttmm_main()
"#;

/// Runs the entry point in a child Python interpreter.
pub struct PythonTarget {
    python: String,
    events_dir: PathBuf,
}

impl PythonTarget {
    /// `events_dir` holds the temporary event file while the child runs.
    pub fn new(python: impl Into<String>, events_dir: &Path) -> Self {
        Self {
            python: python.into(),
            events_dir: events_dir.to_path_buf(),
        }
    }

    fn events_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        self.events_dir
            .join(format!("trace-{}-{nanos}.jsonl", std::process::id()))
    }
}

impl TraceTarget for PythonTarget {
    fn run(
        &mut self,
        root: &Path,
        entry: &TraceEntry,
        args: &[String],
        stop: &StopHandle,
        sink: &mut EventSink<'_>,
    ) -> Result<TargetExit> {
        fs::create_dir_all(&self.events_dir)?;
        let events_path = self.events_path();
        let target_error = |message: String| Error::TraceTarget {
            entry: entry.to_string(),
            message,
        };

        let child = Command::new(&self.python)
            .arg("-c")
            .arg(BOOTSTRAP)
            .arg(&events_path)
            .arg(entry.kind())
            .arg(entry.to_string())
            .args(args)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::from(std::io::stderr()))
            .spawn()
            .map_err(|err| target_error(format!("failed to start {}: {err}", self.python)))?;
        let mut guard = ChildGuard::new(child);

        let exit = loop {
            if let Some(status) = guard.try_wait()? {
                break Some(status);
            }
            if stop.is_stopped() {
                tracing::info!("stopping trace target {entry}");
                guard.kill();
                break None;
            }
            thread::sleep(POLL_INTERVAL);
        };

        let mut failure = None;
        let replayed = replay_events(&events_path, sink, &mut failure);
        if let Err(err) = fs::remove_file(&events_path) {
            tracing::debug!("could not remove {}: {err}", events_path.display());
        }
        replayed?;

        match exit {
            None => Ok(TargetExit::Cancelled),
            Some(status) if status.success() => Ok(TargetExit::Completed),
            Some(status) => Err(target_error(
                failure.unwrap_or_else(|| format!("interpreter exited with {status}")),
            )),
        }
    }
}

/// Feed every complete line of the event file to `sink`. A torn last line
/// from a killed child is ignored.
fn replay_events(
    path: &Path,
    sink: &mut EventSink<'_>,
    failure: &mut Option<String>,
) -> Result<()> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: RawEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!("skipping malformed trace line: {err}");
                continue;
            }
        };
        if let RawEvent::Error { message } = &event {
            *failure = Some(message.clone());
        }
        sink(event)?;
    }
    Ok(())
}

/// Kills and reaps the child if it is still running when dropped.
struct ChildGuard {
    child: Child,
    exited: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            exited: false,
        }
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.exited = true;
        }
        Ok(status)
    }

    fn kill(&mut self) {
        if self.exited {
            return;
        }
        if let Err(err) = self.child.kill() {
            tracing::debug!("kill failed: {err}");
        }
        if self.child.wait().is_ok() {
            self.exited = true;
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_skips_torn_lines_and_records_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(
            &path,
            "{\"e\":\"call\",\"f\":\"a.py\",\"l\":1,\"n\":\"f\",\"t\":5}\n{\"e\":\"return\"}\n{\"e\":\"error\",\"msg\":\"ValueError: bad\"}\n{\"e\":\"ca",
        )
        .unwrap();
        let mut seen = Vec::new();
        let mut failure = None;
        {
            let mut sink = |event: RawEvent| {
                seen.push(event);
                Ok::<(), Error>(())
            };
            replay_events(&path, &mut sink, &mut failure).unwrap();
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(failure.as_deref(), Some("ValueError: bad"));
    }

    #[test]
    fn missing_event_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = |_event: RawEvent| Ok::<(), Error>(());
        let mut failure = None;
        replay_events(&dir.path().join("none.jsonl"), &mut sink, &mut failure).unwrap();
        assert!(failure.is_none());
    }
}
