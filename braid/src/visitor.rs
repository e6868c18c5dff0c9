//! Bounded-parallelism DAG traversal with explicit pause/resume.
//!
//! One worker thread runs per *running* visitor; a paused visitor blocks on
//! its private wake channel and stops counting against the parallelism
//! budget, so arbitrarily deep pause chains cannot starve the scheduler. All
//! bookkeeping lives on the coordinating thread; workers only send messages.

use crate::errors::{panic_message, Error};
use crossbeam_channel::{bounded, unbounded, Sender};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

enum Msg {
    Finished { idx: usize, cancel: bool, panic: Option<String> },
    Pause { idx: usize, until: usize, wake: Sender<bool> },
}

/// Handed to each visit closure; `pause` suspends the calling visitor until
/// another node finishes the current pass.
pub(crate) struct PauseHandle<'a> {
    idx: usize,
    msg_tx: &'a Sender<Msg>,
}

impl PauseHandle<'_> {
    /// Blocks until `until` has been visited. Returns `false` if the pass is
    /// aborting and the caller should bail out quickly.
    pub fn pause(&self, until: usize) -> bool {
        let (wake_tx, wake_rx) = bounded::<bool>(1);
        if self.msg_tx.send(Msg::Pause { idx: self.idx, until, wake: wake_tx }).is_err() {
            return false;
        }
        wake_rx.recv().unwrap_or(false)
    }
}

/// Visits every node once, never starting a node before all of its `deps`
/// have finished, running at most `limit` unpaused visitors at a time.
///
/// The visit closure returns `true` to cancel the pass: no new work starts,
/// active visitors drain, paused visitors are woken with `false`.
///
/// On deadlock (every runnable visitor is paused) or an unvisitable node
/// (wait count never reaches zero) the pass reports one dependency cycle.
pub(crate) fn parallel_visit(
    deps: &[Vec<usize>],
    limit: usize,
    name_of: &(dyn Fn(usize) -> String + Sync),
    visit: &(dyn Fn(usize, &PauseHandle<'_>) -> bool + Sync),
) -> Result<(), Vec<Error>> {
    let n = deps.len();
    if n == 0 {
        return Ok(());
    }
    let limit = limit.max(1);

    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut waiting: Vec<usize> = vec![0; n];
    for (i, ds) in deps.iter().enumerate() {
        for &d in ds {
            succs[d].push(i);
            waiting[i] += 1;
        }
    }

    let (msg_tx, msg_rx) = unbounded::<Msg>();
    let mut backlog: VecDeque<usize> = (0..n).filter(|&i| waiting[i] == 0).collect();
    let mut paused_ready: VecDeque<Sender<bool>> = VecDeque::new();
    // until-idx → visitors paused on it.
    let mut pause_map: HashMap<usize, Vec<(usize, Sender<bool>)>> = HashMap::new();
    // pauser-idx → until-idx, for the cycle check.
    let mut pausing: HashMap<usize, usize> = HashMap::new();
    let mut done = vec![false; n];
    let mut active = 0usize;
    let mut outstanding = 0usize;
    let mut cancelled = false;
    let mut errors: Vec<Error> = Vec::new();

    thread::scope(|scope| {
        loop {
            // Fill capacity: resume paused-ready visitors before fresh starts.
            while !cancelled && active < limit {
                if let Some(wake) = paused_ready.pop_front() {
                    let _ = wake.send(true);
                    active += 1;
                } else if let Some(idx) = backlog.pop_front() {
                    active += 1;
                    outstanding += 1;
                    let tx = msg_tx.clone();
                    scope.spawn(move || {
                        let handle = PauseHandle { idx, msg_tx: &tx };
                        let (cancel, panic) =
                            match catch_unwind(AssertUnwindSafe(|| visit(idx, &handle))) {
                                Ok(cancel) => (cancel, None),
                                Err(payload) => (true, Some(panic_message(payload.as_ref()))),
                            };
                        let _ = tx.send(Msg::Finished { idx, cancel, panic });
                    });
                } else {
                    break;
                }
            }

            if outstanding == 0 {
                break;
            }

            // Everyone still out is paused and nothing can wake them: that is
            // a cycle through the pause graph.
            if active == 0 && paused_ready.is_empty() && (cancelled || backlog.is_empty()) {
                if !cancelled {
                    errors.extend(report_cycle(deps, &done, &pausing, name_of));
                }
                cancelled = true;
                flush_paused(&mut pause_map, &mut pausing, &mut paused_ready, &mut active);
                continue;
            }

            match msg_rx.recv().expect("visitor workers hung up") {
                Msg::Pause { idx, until, wake } => {
                    active -= 1;
                    if cancelled {
                        let _ = wake.send(false);
                        active += 1;
                    } else if done[until] {
                        paused_ready.push_back(wake);
                    } else {
                        pausing.insert(idx, until);
                        pause_map.entry(until).or_default().push((idx, wake));
                    }
                }
                Msg::Finished { idx, cancel, panic } => {
                    active -= 1;
                    outstanding -= 1;
                    done[idx] = true;
                    if let Some(message) = panic {
                        errors.push(Error::Internal {
                            phase: format!("visit of {}", name_of(idx)),
                            message,
                        });
                    }
                    if cancel && !cancelled {
                        cancelled = true;
                        flush_paused(&mut pause_map, &mut pausing, &mut paused_ready, &mut active);
                    }
                    if !cancelled {
                        for &succ in &succs[idx] {
                            waiting[succ] -= 1;
                            if waiting[succ] == 0 {
                                backlog.push_back(succ);
                            }
                        }
                    }
                    if let Some(pausers) = pause_map.remove(&idx) {
                        for (pauser, wake) in pausers {
                            pausing.remove(&pauser);
                            paused_ready.push_back(wake);
                        }
                    }
                }
            }
        }
    });

    // An unvisited node with no pause involved means the dependency graph
    // itself has a cycle.
    if !cancelled && done.iter().any(|d| !d) {
        errors.extend(report_cycle(deps, &done, &pausing, name_of));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Wakes every paused visitor with the abort signal so the pass can drain.
fn flush_paused(
    pause_map: &mut HashMap<usize, Vec<(usize, Sender<bool>)>>,
    pausing: &mut HashMap<usize, usize>,
    paused_ready: &mut VecDeque<Sender<bool>>,
    active: &mut usize,
) {
    for (_, pausers) in pause_map.drain() {
        for (_, wake) in pausers {
            let _ = wake.send(false);
            *active += 1;
        }
    }
    pausing.clear();
    for wake in paused_ready.drain(..) {
        let _ = wake.send(false);
        *active += 1;
    }
}

/// DFS over wait edges (unfinished deps) plus pause edges, reporting the
/// first cycle found as one summary error plus one error per edge.
fn report_cycle(
    deps: &[Vec<usize>],
    done: &[bool],
    pausing: &HashMap<usize, usize>,
    name_of: &(dyn Fn(usize) -> String + Sync),
) -> Vec<Error> {
    let n = deps.len();
    let edges = |i: usize| -> Vec<usize> {
        let mut out: Vec<usize> = deps[i].iter().copied().filter(|&d| !done[d]).collect();
        if let Some(&until) = pausing.get(&i) {
            if !done[until] {
                out.push(until);
            }
        }
        out
    };

    // Visit pause sources first so the reported cycle starts at a pauser.
    let starts: Vec<usize> =
        pausing.keys().copied().chain((0..n).filter(|&i| !done[i])).collect();

    let mut color = vec![0u8; n]; // 0 white, 1 grey, 2 black
    let mut stack: Vec<usize> = Vec::new();
    for start in starts {
        if color[start] != 0 {
            continue;
        }
        if let Some(cycle) = dfs(start, &edges, &mut color, &mut stack) {
            let mut errors = vec![Error::misc("encountered dependency cycle")];
            for (i, &node) in cycle.iter().enumerate() {
                let next = cycle[(i + 1) % cycle.len()];
                errors.push(Error::misc(format!(
                    "{} depends on {}",
                    name_of(node),
                    name_of(next),
                )));
            }
            return errors;
        }
    }
    // Nodes went unvisited but no cycle was found; report what is stuck.
    vec![Error::misc("unvisited modules remain with no dependency cycle; this is a braid bug")]
}

fn dfs(
    node: usize,
    edges: &dyn Fn(usize) -> Vec<usize>,
    color: &mut Vec<u8>,
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    color[node] = 1;
    stack.push(node);
    for next in edges(node) {
        match color[next] {
            0 => {
                if let Some(cycle) = dfs(next, edges, color, stack) {
                    return Some(cycle);
                }
            }
            1 => {
                let at = stack.iter().position(|&s| s == next).expect("grey node on stack");
                return Some(stack[at..].to_vec());
            }
            _ => {}
        }
    }
    stack.pop();
    color[node] = 2;
    None
}
