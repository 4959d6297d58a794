//! Interactive password entry.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::tty::IsTty;

/// Ask for `user`'s password on stderr. Echo is disabled when stdin is a
/// terminal; otherwise one line is read from stdin.
pub fn read_password(user: &str) -> Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{user}'s password: ")?;
    stderr.flush()?;

    if !io::stdin().is_tty() {
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read password from stdin")?;
        return Ok(line.trim_end_matches(['\r', '\n']).to_string());
    }

    let result = read_hidden();
    writeln!(stderr)?;
    result
}

/// Leaves raw mode on drop.
struct RawMode;

impl RawMode {
    fn enable() -> Result<Self> {
        enable_raw_mode().context("failed to switch the terminal to raw mode")?;
        Ok(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

fn read_hidden() -> Result<String> {
    let _raw = RawMode::enable()?;
    let mut password = String::new();
    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind == KeyEventKind::Release {
            continue;
        }
        match apply_key(&mut password, key) {
            Entry::Continue => {}
            Entry::Done => return Ok(password),
            Entry::Cancelled => bail!("password entry cancelled"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Entry {
    Continue,
    Done,
    Cancelled,
}

fn apply_key(password: &mut String, key: KeyEvent) -> Entry {
    if key.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(key.code, KeyCode::Char('c') | KeyCode::Char('C'))
    {
        return Entry::Cancelled;
    }
    match key.code {
        KeyCode::Enter => Entry::Done,
        KeyCode::Esc => Entry::Cancelled,
        KeyCode::Backspace => {
            password.pop();
            Entry::Continue
        }
        KeyCode::Char(c) => {
            password.push(c);
            Entry::Continue
        }
        _ => Entry::Continue,
    }
}
