//! Statistics about the JIT. Durations are wall-clock time and so only a rough guide.

use parking_lot::Mutex;
use std::{
    cell::Cell,
    env, fs,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record statistics if the user defines `DYNJIT_LOG_STATS`.
pub(crate) struct Stats {
    // Almost all runs won't record statistics, so `None` gives a cheap "nothing to do" check
    // before taking the lock.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    functions_compiled_ok: u64,
    functions_compiled_err: u64,
    /// How many times has compiled code deoptimised?
    deopts: u64,
    /// How many times has compiled code been entered?
    function_executions: u64,
    /// The time spent in each [TimingState].
    durations: [Duration; TimingState::COUNT],
}

impl Stats {
    pub fn new() -> Self {
        Self {
            inner: env::var("DYNJIT_LOG_STATS")
                .ok()
                .map(|p| Mutex::new(StatsInner::new(p))),
        }
    }

    /// Statistics written to `output_path` regardless of the environment.
    #[cfg(test)]
    pub fn with_output(output_path: &str) -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new(output_path.to_owned()))),
        }
    }

    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            f(&mut mtx.lock());
        }
    }

    pub fn function_compiled_ok(&self) {
        self.update_with(|inner| inner.functions_compiled_ok += 1);
    }

    pub fn function_compiled_err(&self) {
        self.update_with(|inner| inner.functions_compiled_err += 1);
    }

    pub fn deopt(&self) {
        self.update_with(|inner| inner.deopts += 1);
    }

    pub fn function_executed(&self) {
        self.update_with(|inner| inner.function_executions += 1);
    }

    /// Change the [TimingState] the current thread is in.
    pub fn timing_state(&self, new_state: TimingState) {
        self.update_with(|inner| {
            let now = Instant::now();
            let (prev_state, then) = VM_STATE.replace((new_state, now));
            let d = now.saturating_duration_since(then);
            inner.durations[prev_state as usize] =
                inner.durations[prev_state as usize].saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }

    #[cfg(test)]
    fn to_json(&self) -> Option<String> {
        self.inner.as_ref().map(|x| x.lock().to_json())
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            functions_compiled_ok: 0,
            functions_compiled_err: 0,
            deopts: 0,
            function_executions: 0,
            durations: [Duration::new(0, 0); TimingState::COUNT],
        }
    }

    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON, sorted by field name so that the output can be matched
    /// textually.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = vec![
            ("deopts".to_owned(), self.deopts.to_string()),
            (
                "function_executions".to_owned(),
                self.function_executions.to_string(),
            ),
            (
                "functions_compiled_err".to_owned(),
                self.functions_compiled_err.to_string(),
            ),
            (
                "functions_compiled_ok".to_owned(),
                self.functions_compiled_ok.to_string(),
            ),
        ];
        for v in TimingState::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The different timing states a thread can be in.
///
/// Variants must be numbered `0..TimingState::COUNT`. A variant whose `to_string` is empty is
/// not reported.
#[repr(u8)]
#[derive(Copy, Clone, Display, EnumCount, EnumIter)]
pub(crate) enum TimingState {
    /// Not attributed to anything.
    #[strum(to_string = "")]
    None,
    #[strum(to_string = "duration_compiling")]
    Compiling,
    #[strum(to_string = "duration_deopting")]
    Deopting,
    #[strum(to_string = "duration_jit_executing")]
    JitExecuting,
}

thread_local! {
    static VM_STATE: Cell<(TimingState, Instant)> = Cell::new((TimingState::None, Instant::now()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_is_sorted() {
        let s = Stats::with_output("-");
        s.function_compiled_ok();
        s.function_compiled_ok();
        s.deopt();
        s.timing_state(TimingState::Compiling);
        s.timing_state(TimingState::None);
        let json = s.to_json().unwrap();
        let pat = regex::Regex::new(
            r#"^\{
    "deopts": 1,
    "duration_compiling": \d+\.\d{3},
    "duration_deopting": 0\.000,
    "duration_jit_executing": 0\.000,
    "function_executions": 0,
    "functions_compiled_err": 0,
    "functions_compiled_ok": 2
\}$"#,
        )
        .unwrap();
        assert!(pat.is_match(&json), "{json}");
    }
}
