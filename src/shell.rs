//! Line-oriented command shell for the measurement harness.
//!
//! One whitespace-tokenized command per line on stdin; quoted tokens keep
//! their spaces. Replies go to stdout prefixed `m-` (normal) or `e-`
//! (error), with `m-ready` after every command. Logging stays on stderr so
//! the protocol stream is never polluted.

use std::io::{self, BufRead};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Settings;
use crate::error::ProbeError;
use crate::pipeline::downsample::validate_sample_rate;
use crate::probe::Js110;
use crate::trace::TraceSession;

struct Command {
    name: &'static str,
    usage: &'static str,
    desc: &'static str,
    run: fn(&mut Shell, &[String]),
}

const COMMANDS: &[Command] = &[
    Command {
        name: "init",
        usage: "[serial] [drop_thresh]",
        desc: "open the first (or matching) probe and wire the pipeline",
        run: Shell::cmd_init,
    },
    Command {
        name: "deinit",
        usage: "",
        desc: "stop tracing if running and close the probe",
        run: Shell::cmd_deinit,
    },
    Command {
        name: "power",
        usage: "[on|off]",
        desc: "toggle the probe's output rail",
        run: Shell::cmd_power,
    },
    Command {
        name: "trace",
        usage: "[on [dir [prefix]] | off]",
        desc: "start or stop the energy trace",
        run: Shell::cmd_trace,
    },
    Command {
        name: "timer",
        usage: "[on|off]",
        desc: "observe GPI0 falling edges as timestamps",
        run: Shell::cmd_timer,
    },
    Command {
        name: "rate",
        usage: "[hz]",
        desc: "set the downsampled output rate (must divide 2000000)",
        run: Shell::cmd_rate,
    },
    Command {
        name: "voltage",
        usage: "",
        desc: "read the 2-second mean bus voltage in mV",
        run: Shell::cmd_voltage,
    },
    Command {
        name: "help",
        usage: "",
        desc: "list commands",
        run: Shell::cmd_help,
    },
    Command {
        name: "exit",
        usage: "",
        desc: "clean shutdown",
        run: Shell::cmd_exit,
    },
];

pub struct Shell {
    settings: Settings,
    probe: Option<Js110>,
    trace: Option<TraceSession>,
    sample_rate: u32,
    drop_threshold: f64,
    observe_timestamps: Arc<AtomicBool>,
}

impl Shell {
    pub fn new(settings: Settings) -> Self {
        let sample_rate = settings.sample_rate;
        Self {
            settings,
            probe: None,
            trace: None,
            sample_rate,
            drop_threshold: 0.0,
            observe_timestamps: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn dispatch(&mut self, tokens: &[String]) {
        let Some(command) = COMMANDS.iter().find(|c| c.name == tokens[0]) else {
            println!("e-[Unknown command: {}]", tokens.join(" "));
            return;
        };
        (command.run)(self, tokens);
    }

    /// Common teardown for `exit`, signals and EOF.
    pub fn shutdown(&mut self) {
        if self.trace.is_some() {
            self.stop_trace();
        }
        if let Some(mut probe) = self.probe.take() {
            probe.close();
        }
    }

    fn cmd_init(&mut self, args: &[String]) {
        if self.trace.is_some() {
            println!("e-[Cannot init while tracing]");
            return;
        }
        if self.probe.is_some() {
            println!("e-[A probe is already initialized, deinit first]");
            return;
        }
        let serial = args.get(1).cloned().unwrap_or_default();
        if let Some(threshold) = args.get(2) {
            match threshold.parse::<f64>() {
                Ok(value) if value >= 0.0 => self.drop_threshold = value,
                _ => {
                    println!("e-[Invalid drop threshold: {threshold}]");
                    return;
                }
            }
        }
        match Js110::open(&serial) {
            Ok(probe) => {
                self.sample_rate = self.settings.sample_rate;
                println!("m-[Opened Joulescope at path {}]", probe.description());
                self.probe = Some(probe);
            }
            Err(err) => println!("e-[{err}]"),
        }
    }

    fn cmd_deinit(&mut self, _args: &[String]) {
        self.shutdown();
    }

    fn cmd_power(&mut self, args: &[String]) {
        let on = match args.get(1).map(String::as_str) {
            Some("on") => true,
            Some("off") => false,
            _ => {
                println!("e-[Usage: power [on|off]]");
                return;
            }
        };
        if self.trace.is_some() {
            if on {
                println!("e-[Cannot talk to the probe while tracing]");
                return;
            }
            // Powering off implies the trace is over.
            self.stop_trace();
        }
        let Some(probe) = self.probe.as_mut() else {
            println!("e-[No probe is open]");
            return;
        };
        match probe.power_on(on) {
            Ok(()) => println!("m-power[{}]", if on { "on" } else { "off" }),
            Err(err) => println!("e-[{err}]"),
        }
    }

    fn cmd_trace(&mut self, args: &[String]) {
        match args.get(1).map(String::as_str) {
            Some("on") => {
                let dir = args.get(2).cloned().unwrap_or_else(|| ".".to_string());
                let prefix = args.get(3).cloned().unwrap_or_else(|| "js110".to_string());
                self.start_trace(Path::new(&dir), &prefix);
            }
            Some("off") => self.stop_trace(),
            _ => println!("e-[Usage: trace [on [dir [prefix]] | off]]"),
        }
    }

    fn start_trace(&mut self, dir: &Path, prefix: &str) {
        if self.trace.is_some() {
            println!("e-[Trace is already running]");
            return;
        }
        let Some(probe) = self.probe.as_mut() else {
            println!("e-[No probe is open]");
            return;
        };
        match TraceSession::start(
            probe,
            &self.settings,
            self.sample_rate,
            dir,
            prefix,
            self.observe_timestamps.clone(),
        ) {
            Ok(trace) => {
                self.trace = Some(trace);
                println!("m-trace[on]");
                println!("m-dropthresh[{}]", self.drop_threshold);
            }
            Err(err) => println!("e-[{err}]"),
        }
    }

    fn stop_trace(&mut self) {
        let Some(trace) = self.trace.take() else {
            println!("e-[Trace isn't running]");
            return;
        };
        let Some(probe) = self.probe.as_mut() else {
            println!("e-[No probe is open]");
            return;
        };
        match trace.stop(probe) {
            Ok(outcome) => {
                let energy = file_name(&outcome.energy_path);
                let timestamps = file_name(&outcome.timestamps_path);
                println!("m-regfile-fn[{energy}]-type[emon]-name[js110]");
                println!("m-regfile-fn[{timestamps}]-type[etime]-name[js110]");
                println!("m-trace[off]");
                if let Some((_, msg)) = probe.take_abort() {
                    println!("e-[Device failed during trace: {msg}]");
                }
                if let Some(fatal) = outcome.fatal {
                    println!("e-[{fatal}]");
                    if matches!(
                        fatal,
                        ProbeError::RingExhausted | ProbeError::Invariant(_)
                    ) {
                        std::process::exit(-1);
                    }
                }
                let nan_pct = outcome.stats.nan_percent();
                log::info!(
                    "trace finished: {} samples, {} dropped packets, {:.4}% nan",
                    outcome.stats.total_samples,
                    outcome.stats.dropped_packets,
                    nan_pct
                );
                if self.drop_threshold > 0.0 && nan_pct > self.drop_threshold {
                    println!("e-[Sample drop rate {nan_pct:.3}% exceeds threshold]");
                }
            }
            Err(err) => {
                println!("e-[{err}]");
                std::process::exit(-1);
            }
        }
    }

    fn cmd_timer(&mut self, args: &[String]) {
        let on = match args.get(1).map(String::as_str) {
            Some("on") => true,
            Some("off") => false,
            _ => {
                println!("e-[Usage: timer [on|off]]");
                return;
            }
        };
        self.observe_timestamps.store(on, Ordering::Relaxed);
        println!("m-timer[{}]", if on { "on" } else { "off" });
    }

    fn cmd_rate(&mut self, args: &[String]) {
        if self.trace.is_some() {
            println!("e-[Cannot change the rate while tracing]");
            return;
        }
        if let Some(value) = args.get(1) {
            match value.parse::<u32>().map_err(|e| {
                ProbeError::Config(format!("bad sample rate '{value}': {e}"))
            }) {
                Ok(rate) => match validate_sample_rate(rate) {
                    Ok(_) => self.sample_rate = rate,
                    Err(err) => println!("e-[{err}]"),
                },
                Err(err) => println!("e-[{err}]"),
            }
        }
        println!("m-rate-hz[{}]", self.sample_rate);
    }

    fn cmd_voltage(&mut self, _args: &[String]) {
        if self.trace.is_some() {
            println!("e-[Cannot talk to the probe while tracing]");
            return;
        }
        let Some(probe) = self.probe.as_mut() else {
            println!("e-[No probe is open]");
            return;
        };
        match probe.voltage_mv() {
            Ok(mv) => println!("m-voltage-mv[{mv}]"),
            Err(err) => println!("e-[{err}]"),
        }
    }

    fn cmd_help(&mut self, _args: &[String]) {
        for command in COMMANDS {
            println!("m-[{:8} {:28} {}]", command.name, command.usage, command.desc);
        }
    }

    fn cmd_exit(&mut self, _args: &[String]) {
        self.shutdown();
        println!("m-exit");
        std::process::exit(0);
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Split one command line into tokens; double quotes group spaces.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token || !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => current.push(c),
        }
    }
    if has_token || !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Read commands until `exit` or EOF. Returns the process exit code for
/// the EOF path; `exit` terminates directly.
pub fn run(shell: &Arc<Mutex<Shell>>) -> i32 {
    println!("m-ready");
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                log::warn!("stdin read failed: {err}");
                continue;
            }
        }
        let tokens = tokenize(line.trim());
        if !tokens.is_empty() && !tokens[0].is_empty() {
            let mut shell = shell.lock().expect("shell poisoned");
            shell.dispatch(&tokens);
        }
        println!("m-ready");
    }
    // stdin closed without an `exit`: release the device, then fail.
    shell.lock().expect("shell poisoned").shutdown();
    println!("e-[Unexpected exit]");
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_splits_on_whitespace() {
        assert_eq!(tokenize("trace on /tmp js110"), ["trace", "on", "/tmp", "js110"]);
        assert_eq!(tokenize("  rate\t1000  "), ["rate", "1000"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn tokenizer_keeps_quoted_spaces() {
        assert_eq!(
            tokenize(r#"trace on "/tmp/my run" prefix"#),
            ["trace", "on", "/tmp/my run", "prefix"]
        );
        assert_eq!(tokenize(r#"init "" 0.1"#), ["init", "", "0.1"]);
    }

    #[test]
    fn unknown_commands_do_not_panic() {
        let mut shell = Shell::new(Settings::default());
        shell.dispatch(&["bogus".to_string()]);
        shell.dispatch(&["rate".to_string(), "9999999".to_string()]);
        assert_eq!(shell.sample_rate, Settings::default().sample_rate);
    }

    #[test]
    fn rate_updates_only_on_valid_divisors() {
        let mut shell = Shell::new(Settings::default());
        shell.dispatch(&["rate".to_string(), "10000".to_string()]);
        assert_eq!(shell.sample_rate, 10_000);
        shell.dispatch(&["rate".to_string(), "3".to_string()]);
        assert_eq!(shell.sample_rate, 10_000, "previous rate is retained");
    }

    #[test]
    fn timer_toggles_the_shared_flag() {
        let mut shell = Shell::new(Settings::default());
        shell.dispatch(&["timer".to_string(), "on".to_string()]);
        assert!(shell.observe_timestamps.load(Ordering::Relaxed));
        shell.dispatch(&["timer".to_string(), "off".to_string()]);
        assert!(!shell.observe_timestamps.load(Ordering::Relaxed));
    }
}
