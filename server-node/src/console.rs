//! # User interface for a unix terminal
//! Renders server's internal state and latest messages in a consistent way

use std::{
    collections::VecDeque,
    error::Error,
    io::{self, IsTerminal, Write},
    sync::{
        mpsc::{self, Sender},
        LazyLock,
    },
    thread,
    time::SystemTime,
};
use terminal_size::{terminal_size, Height};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Log,
    Warning,
    Error,
    Cause,
}

impl Level {
    fn style(self) -> &'static str {
        match self {
            Level::Debug => "\x1B[90m",
            Level::Log => "\x1B[0m",
            Level::Warning => "\x1B[33m",
            Level::Error => "\x1B[31m",
            Level::Cause => "\x1B[35m",
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Level::Debug => "debug: ",
            Level::Log => "",
            Level::Warning => "warning: ",
            Level::Error => "error: ",
            Level::Cause => "  caused by: ",
        }
    }
}

struct Entry {
    time: SystemTime,
    level: Level,
    line: String,
}

struct Console {
    history_len: usize,
    event_log: VecDeque<Entry>,
}

impl Console {
    fn push_event(&mut self, entry: Entry) {
        self.event_log.truncate(self.history_len - 1);
        self.event_log.push_front(entry);
    }

    fn new(history_len: usize) -> Self {
        Self {
            history_len,
            event_log: VecDeque::new(),
        }
    }

    fn render(&self, start_time: SystemTime, state: &str) -> io::Result<()> {
        let mut stdout = io::stdout().lock();

        let mut lines: Option<usize> = terminal_size().map(|(_, Height(h))| h.into());

        // Clear terminal and move cursor to top left
        stdout.write_all(b"\x1B[2J\x1B[H")?;

        if let Some(lines) = &mut lines {
            let remaining = lines.saturating_sub(state.lines().count());
            if remaining > 0 {
                stdout.write_all(state.as_bytes())?;
                *lines = remaining;
            } else {
                writeln!(stdout, "Terminal height is too low! Can't show server state.")?;
                *lines = lines.saturating_sub(2); // Probably takes two lines due to small width
            }
            *lines = lines.saturating_sub(1);
        }

        // Print log (up to the remaining terminal lines, no more)
        let lines = lines.unwrap_or(usize::MAX);
        for Entry { time, level, line } in self.event_log.iter().take(lines).rev() {
            if let Ok(duration) = time.duration_since(start_time) {
                write!(stdout, "\x1B[90m{duration:<9.3?}:\x1B[0m ")?;
            }
            writeln!(stdout, "{}{line}\x1B[0m", level.style())?;
        }

        Ok(())
    }
}

enum ConsoleUpdate {
    State(String),
    Log(Entry),
}

static CONSOLE: LazyLock<Sender<ConsoleUpdate>> = LazyLock::new(|| {
    let start_time = SystemTime::now();
    let (tx, rx) = mpsc::channel();
    if let Err(e) = thread::Builder::new()
        .name(format!("{}::console_ui_thread", module_path!()))
        .spawn(move || {
            let mut console = Console::new(1024);
            let mut state = String::new();
            while let Ok(update) = rx.recv() {
                match update {
                    ConsoleUpdate::State(s) => state = s,
                    ConsoleUpdate::Log(entry) => console.push_event(entry),
                }
                if let Err(e) = console.render(start_time, &state) {
                    panic!("Can't render UI to console!\n{e}");
                }
            }
        })
    {
        panic!("Can't spawn UI thread!\n{e}");
    }
    tx
});

/// Whether output goes to the full screen UI. Never in tests, they print plain lines.
#[must_use]
pub fn is_terminal() -> bool {
    !cfg!(test) && io::stdout().is_terminal()
}

pub fn log_string(event: &str, level: Level) {
    if is_terminal() {
        for line in event.split('\n') {
            let entry = Entry {
                time: SystemTime::now(),
                level,
                line: line.to_owned(),
            };
            // The UI thread lives as long as the process, a failed send only loses one line
            let _ = CONSOLE.send(ConsoleUpdate::Log(entry));
        }
    } else {
        // Don't write control characters, just output lines as is
        println!("{}{event}", level.prefix());
    }
}

pub fn update_state(state: String) {
    if is_terminal() {
        let _ = CONSOLE.send(ConsoleUpdate::State(state));
    }
}

pub fn log_error(mut error: &dyn Error) {
    log_string(&format!("{error}"), Level::Error);
    while let Some(source) = error.source() {
        log_string(&format!("{source}"), Level::Cause);
        error = source;
    }
}

macro_rules! debug {
    ($($arg:tt)*) => {{
            if std::env::var("SERVER_VERBOSE").is_ok() {
                crate::console::log_string(&format!($($arg)*), crate::console::Level::Debug);
            }
    }};
}

macro_rules! error {
    ($err:expr, $($arg:tt)*) => {{
            crate::console::log_string(&format!($($arg)*), crate::console::Level::Warning);
            crate::console::log_error($err);
    }};
    ($err:expr) => {{
            crate::console::log_error($err);
    }}
}

macro_rules! log {
    ($($arg:tt)*) => {{
            crate::console::log_string(&format!($($arg)*), crate::console::Level::Log);
    }};
}

macro_rules! warning {
    ($($arg:tt)*) => {{
            crate::console::log_string(&format!($($arg)*), crate::console::Level::Warning);
    }};
}

pub(crate) use {debug, error, log, warning};
