//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use tasksync_core::{SyncState, Task};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print a single task with all its fields
    pub fn print_task(&self, task: &Task) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:          {}", task.id);
                println!("Text:        {}", task.text);
                if let Some(ref desc) = task.description {
                    println!("Description: {}", desc);
                }
                println!("Done:        {}", if task.done { "yes" } else { "no" });
                if !task.tags.is_empty() {
                    println!("Tags:        {}", task.tags.join(", "));
                }
                if let Some(due) = task.due_date {
                    println!("Due:         {}", due.format("%Y-%m-%d"));
                }
                if let Some(created) = task.created_at {
                    println!("Created:     {}", created.format("%Y-%m-%d %H:%M"));
                }
                println!("Sync:        {}", sync_label(&task.sync));
            }
            OutputFormat::Json => print_json(task),
            OutputFormat::Quiet => println!("{}", task.id),
        }
    }

    /// Print a list of tasks
    pub fn print_tasks(&self, tasks: &[Task]) {
        match self.format {
            OutputFormat::Human => {
                if tasks.is_empty() {
                    println!("No tasks found.");
                    return;
                }
                for task in tasks {
                    println!("{}", task_line(task));
                }
                println!("\n{} task(s)", tasks.len());
            }
            OutputFormat::Json => print_json(&tasks),
            OutputFormat::Quiet => {
                for task in tasks {
                    println!("{}", task.id);
                }
            }
        }
    }

    /// Print a list of tags
    pub fn print_tags(&self, tags: &[String]) {
        match self.format {
            OutputFormat::Human => {
                if tags.is_empty() {
                    println!("No tags found.");
                    return;
                }
                for tag in tags {
                    println!("#{}", tag);
                }
                println!("\n{} tag(s)", tags.len());
            }
            OutputFormat::Json => print_json(&tags),
            OutputFormat::Quiet => {
                for tag in tags {
                    println!("{}", tag);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr (suppressed in quiet mode)
    pub fn warn(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", message);
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

/// One-line rendering used by `list` and `watch`
pub fn task_line(task: &Task) -> String {
    let check = if task.done { "[x]" } else { "[ ]" };
    let mut line = format!(
        "{} {} {}",
        short_id(task.id.as_str()),
        check,
        truncate(&task.text, 50)
    );
    if !task.tags.is_empty() {
        let tags: Vec<String> = task.tags.iter().map(|t| format!("#{}", t)).collect();
        line.push_str(&format!(" {}", tags.join(" ")));
    }
    if let Some(due) = task.due_date {
        line.push_str(&format!(" (due {})", due.format("%Y-%m-%d")));
    }
    match task.sync {
        SyncState::Confirmed => {}
        SyncState::Pending { .. } => line.push_str(" *"),
        SyncState::Failed { .. } => line.push_str(" !"),
    }
    line
}

fn sync_label(state: &SyncState) -> String {
    match state {
        SyncState::Confirmed => "synced".to_string(),
        SyncState::Pending { action, attempts } => {
            format!("pending {:?} ({} attempt(s))", action, attempts).to_lowercase()
        }
        SyncState::Failed { action, attempts } => {
            format!("failed {:?} after {} attempt(s)", action, attempts).to_lowercase()
        }
    }
}

/// First 8 characters of an id
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasksync_core::{NewTask, SyncAction};

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ääääääääääää", 5), "ää...");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_task_line_marks_sync_state() {
        let mut task = Task::from_new(NewTask::new("Buy milk").with_tag_input("home"));
        let line = task_line(&task);
        assert!(line.contains("[ ] Buy milk #home"));
        assert!(line.ends_with(" *"));

        task.done = true;
        task.sync = SyncState::Failed {
            action: SyncAction::Update,
            attempts: 3,
        };
        let line = task_line(&task);
        assert!(line.contains("[x]"));
        assert!(line.ends_with(" !"));
    }

    #[test]
    fn test_sync_label() {
        assert_eq!(sync_label(&SyncState::Confirmed), "synced");
        assert_eq!(
            sync_label(&SyncState::new_insert()),
            "pending insert (0 attempt(s))"
        );
    }
}
