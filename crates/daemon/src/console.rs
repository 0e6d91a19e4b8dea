//! Operator console: line commands on stdin, job events on stdout

use colored::{ColoredString, Colorize};
use jobwatch_core::application::{Supervisor, WatchController};
use jobwatch_core::domain::{JobEvent, JobId, JobSnapshot, JobState};
use std::sync::Arc;
use tabled::{Table, Tabled};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

const HELP: &str = "\
Commands (a job is a file name or a number from `list`):
  list                 show all jobs
  log <job>            print a job's log
  submit <job>         start a job held by manual mode
  stop <job>           stop a queued or running job
  retry <job>          run a stopped or failed job again
  delete <job>         delete the descriptor of a finished job and skip it
  close <job>          dismiss a finished job, keeping the descriptor
  capacity [n]         show or set max parallel workers (1-50)
  watch start|stop     start or stop watching the folder
  auto on|off          admit new files automatically, or hold them
  help                 this text
  quit                 stop all jobs and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    List,
    Log(String),
    Submit(String),
    Stop(String),
    Retry(String),
    Delete(String),
    Close(String),
    Capacity(Option<usize>),
    Watch(bool),
    Auto(bool),
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(Command::Empty);
    };
    let rest: Vec<&str> = words.collect();
    // file names may contain spaces
    let target = || {
        if rest.is_empty() {
            Err(format!("usage: {verb} <job>"))
        } else {
            Ok(rest.join(" "))
        }
    };

    match verb.to_ascii_lowercase().as_str() {
        "list" | "ls" => Ok(Command::List),
        "log" => target().map(Command::Log),
        "submit" | "start" => target().map(Command::Submit),
        "stop" => target().map(Command::Stop),
        "retry" => target().map(Command::Retry),
        "delete" | "skip" => target().map(Command::Delete),
        "close" => target().map(Command::Close),
        "capacity" | "max" => match rest.as_slice() {
            [] => Ok(Command::Capacity(None)),
            [n] => n
                .parse()
                .map(|n| Command::Capacity(Some(n)))
                .map_err(|_| "Please enter a valid number".to_string()),
            _ => Err("usage: capacity [n]".to_string()),
        },
        "watch" => match rest.as_slice() {
            ["start"] | ["on"] => Ok(Command::Watch(true)),
            ["stop"] | ["off"] => Ok(Command::Watch(false)),
            _ => Err("usage: watch start|stop".to_string()),
        },
        "auto" => match rest.as_slice() {
            ["on"] => Ok(Command::Auto(true)),
            ["off"] => Ok(Command::Auto(false)),
            _ => Err("usage: auto on|off".to_string()),
        },
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{other}', try `help`")),
    }
}

fn paint(state: JobState) -> ColoredString {
    let label = state.to_string();
    match state {
        JobState::Queued => label.yellow(),
        JobState::Running => label.cyan(),
        JobState::Stopped => label.magenta(),
        JobState::Succeeded => label.green(),
        JobState::Failed => label.red(),
        JobState::Removed => label.dimmed(),
    }
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "#")]
    index: usize,
    name: String,
    state: String,
    retries: u32,
    exit: String,
    pid: String,
    lines: usize,
}

impl JobRow {
    fn new(index: usize, job: &JobSnapshot) -> Self {
        let or_dash = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
        Self {
            index,
            name: job.name.clone(),
            state: job.state.to_string(),
            retries: job.retries,
            exit: or_dash(job.exit_code.map(|c| c.to_string())),
            pid: or_dash(job.pid.map(|p| p.to_string())),
            lines: job.log_len,
        }
    }
}

/// How the console loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    Quit,
    /// stdin closed; the daemon keeps running until a signal
    InputClosed,
}

pub struct Console {
    supervisor: Supervisor,
    watch: Arc<WatchController>,
}

impl Console {
    pub fn new(supervisor: Supervisor, watch: Arc<WatchController>) -> Self {
        Self { supervisor, watch }
    }

    pub async fn run(&self) -> ConsoleExit {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return ConsoleExit::InputClosed,
                Err(e) => {
                    warn!(error = %e, "Console input failed");
                    return ConsoleExit::InputClosed;
                }
            };
            match parse_command(&line) {
                Ok(Command::Quit) => return ConsoleExit::Quit,
                Ok(command) => self.execute(command).await,
                Err(message) => println!("{}", message.yellow()),
            }
        }
    }

    /// Numbers index into `list` order; anything else is a name or id
    async fn resolve(&self, key: &str) -> Option<JobId> {
        if let Ok(index) = key.parse::<usize>() {
            let jobs = self.supervisor.list().await;
            if let Some(job) = index.checked_sub(1).and_then(|i| jobs.get(i)) {
                return Some(job.id.clone());
            }
        }
        self.supervisor.resolve(key).await
    }

    async fn with_job(&self, key: &str) -> Option<JobId> {
        let id = self.resolve(key).await;
        if id.is_none() {
            println!("{}", format!("No job named '{key}'").yellow());
        }
        id
    }

    pub async fn execute(&self, command: Command) {
        match command {
            Command::Empty | Command::Quit => {}
            Command::Help => println!("{HELP}"),
            Command::List => self.print_list().await,
            Command::Log(key) => {
                if let Some(id) = self.with_job(&key).await {
                    for entry in self.supervisor.log(&id).await.unwrap_or_default() {
                        println!("{}", entry.render());
                    }
                }
            }
            Command::Submit(key) => {
                if let Some(id) = self.with_job(&key).await {
                    report(self.supervisor.submit(&id).await.map(paint));
                }
            }
            Command::Stop(key) => {
                if let Some(id) = self.with_job(&key).await {
                    report(self.supervisor.stop(&id).await.map(paint));
                }
            }
            Command::Retry(key) => {
                if let Some(id) = self.with_job(&key).await {
                    report(self.supervisor.retry(&id).await.map(paint));
                }
            }
            Command::Delete(key) => {
                if let Some(id) = self.with_job(&key).await {
                    report(
                        self.supervisor
                            .delete_and_skip(&id)
                            .await
                            .map(|job| format!("Deleted and skipped {}", job.name).normal()),
                    );
                }
            }
            Command::Close(key) => {
                if let Some(id) = self.with_job(&key).await {
                    report(
                        self.supervisor
                            .close(&id)
                            .await
                            .map(|job| format!("Closed {}", job.name).normal()),
                    );
                }
            }
            Command::Capacity(None) => println!(
                "Max parallel: {} ({} running, {} queued)",
                self.supervisor.capacity().await,
                self.supervisor.active_count().await,
                self.supervisor.queued().await.len()
            ),
            Command::Capacity(Some(n)) => report(
                self.supervisor
                    .set_capacity(n)
                    .await
                    .map(|n| format!("Max parallel processes updated to: {n}").normal()),
            ),
            Command::Watch(true) => {
                if self.watch.start().await {
                    println!("{}", "Started watching".green());
                } else {
                    println!("Already watching");
                }
            }
            Command::Watch(false) => {
                if self.watch.stop().await {
                    println!("{}", "Stopped watching".yellow());
                } else {
                    println!("Not watching");
                }
            }
            Command::Auto(enabled) => {
                self.supervisor.set_auto_process(enabled);
                println!("Auto-process: {}", if enabled { "on" } else { "off" });
            }
        }
    }

    async fn print_list(&self) {
        let jobs = self.supervisor.list().await;
        if jobs.is_empty() {
            println!("{}", "No jobs".dimmed());
            return;
        }
        let rows: Vec<JobRow> = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| JobRow::new(i + 1, job))
            .collect();
        println!("{}", Table::new(rows));
        println!(
            "{} running / {} max, {} queued",
            self.supervisor.active_count().await,
            self.supervisor.capacity().await,
            self.supervisor.queued().await.len()
        );
    }
}

fn report(result: jobwatch_core::Result<ColoredString>) {
    match result {
        Ok(message) => println!("{} {}", "✓".green(), message),
        Err(e) => println!("{} {}", "✗".red(), e),
    }
}

/// Print state changes as they happen
pub async fn print_events(supervisor: Supervisor) {
    let mut events = supervisor.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let name = supervisor
                    .get(event.job_id())
                    .await
                    .map(|j| j.name)
                    .unwrap_or_else(|| event.job_id().to_string());
                match event {
                    JobEvent::Discovered { .. } => println!("{} {}", "+".green(), name),
                    JobEvent::StateChanged { from, to, .. } => {
                        println!("{} {} -> {}", name.bold(), paint(from), paint(to))
                    }
                    JobEvent::Removed { .. } => println!("{} {}", "-".dimmed(), name),
                }
            }
            Err(RecvError::Lagged(missed)) => debug!(missed, "Event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
