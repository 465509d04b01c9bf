//! Task command handlers

use anyhow::{bail, Result};
use chrono::NaiveDate;

use tasksync_core::{EngineError, NewTask, Task, TaskId};

use crate::output::{short_id, task_line, Output, OutputFormat};
use crate::session::Session;

/// Parse a `--due` value
pub fn parse_due(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| format!("invalid date '{}', expected YYYY-MM-DD", value))
}

/// Add a new task
pub async fn add(
    session: &Session,
    text: String,
    description: Option<String>,
    tags: Option<String>,
    due: Option<NaiveDate>,
    output: &Output,
) -> Result<()> {
    let mut new = NewTask::new(text);
    if let Some(desc) = description.filter(|d| !d.trim().is_empty()) {
        new = new.with_description(desc);
    }
    if let Some(ref input) = tags {
        new = new.with_tag_input(input);
    }
    if let Some(due) = due {
        new = new.with_due_date(due);
    }

    let task = match session.engine().add_task(new).await {
        Ok(task) => task,
        Err(EngineError::EmptyText) => bail!("Task text cannot be empty"),
        Err(e) => return Err(e.into()),
    };

    match output.format {
        OutputFormat::Human => output.success(&format!(
            "Added {} {}",
            short_id(task.id.as_str()),
            task.text
        )),
        _ => output.print_task(&task),
    }
    Ok(())
}

/// Toggle a task between open and done
pub async fn toggle(session: &Session, id: &str, output: &Output) -> Result<()> {
    let id = resolve_id(&session.engine().tasks(), id)?;
    let task = session.engine().toggle_done(&id).await?;

    match output.format {
        OutputFormat::Human => {
            let state = if task.done { "done" } else { "open" };
            output.success(&format!("Marked {} {}", short_id(task.id.as_str()), state));
        }
        _ => output.print_task(&task),
    }
    Ok(())
}

/// Delete every completed task
pub async fn clear(session: &Session, output: &Output) -> Result<()> {
    match session.engine().clear_completed().await {
        Ok(0) => output.message("No completed tasks."),
        Ok(count) => output.success(&format!("Deleted {} completed task(s)", count)),
        Err(EngineError::Offline) => {
            bail!("Cannot clear completed tasks while offline. Nothing was deleted.")
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// List tasks, optionally filtered
pub fn list(session: &Session, tag: Option<&str>, query: Option<&str>, output: &Output) {
    let tasks = session.engine().filtered(tag, query.unwrap_or(""));
    output.print_tasks(&tasks);
}

/// Print the task list every time it changes, until Ctrl-C
pub async fn watch(session: &Session, output: &Output) -> Result<()> {
    let mut updates = session.engine().subscribe();
    let mut online = session.connectivity().subscribe();

    output.print_tasks(&session.engine().sorted());
    output.message("Watching for changes (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                output.print_tasks(&session.engine().sorted());
            }
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *online.borrow_and_update();
                output.message(&format!("Connection: {}", status));
            }
        }
    }
    Ok(())
}

/// Resolve a full id or unique id prefix to a task id
fn resolve_id(tasks: &[Task], input: &str) -> Result<TaskId> {
    let input = input.trim();
    if input.is_empty() {
        bail!("Task ID cannot be empty");
    }

    // Exact match first
    if let Some(task) = tasks.iter().find(|t| t.id.as_str() == input) {
        return Ok(task.id.clone());
    }

    let matches: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.id.as_str().starts_with(input))
        .collect();

    match matches.len() {
        0 => bail!("No task found matching: {}", input),
        1 => Ok(matches[0].id.clone()),
        _ => {
            eprintln!("Multiple tasks match '{}':", input);
            for task in &matches {
                eprintln!("  {}", task_line(task));
            }
            bail!("Ambiguous ID. Please provide more characters.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        let mut task = Task::from_new(NewTask::new(format!("Task {}", id)));
        task.id = id.into();
        task
    }

    #[test]
    fn test_parse_due() {
        assert_eq!(
            parse_due("2024-03-01"),
            Ok(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        assert!(parse_due("03/01/2024").is_err());
        assert!(parse_due("").is_err());
    }

    #[test]
    fn test_resolve_id_by_prefix() {
        let tasks = vec![task("abc123"), task("abd456")];
        assert_eq!(resolve_id(&tasks, "abc").unwrap(), TaskId::from("abc123"));
        assert_eq!(resolve_id(&tasks, "abd456").unwrap(), TaskId::from("abd456"));
    }

    #[test]
    fn test_resolve_id_prefers_exact_match() {
        let tasks = vec![task("ab"), task("abc")];
        assert_eq!(resolve_id(&tasks, "ab").unwrap(), TaskId::from("ab"));
    }

    #[test]
    fn test_resolve_id_errors() {
        let tasks = vec![task("abc123"), task("abd456")];
        assert!(resolve_id(&tasks, "ab").is_err());
        assert!(resolve_id(&tasks, "zzz").is_err());
        assert!(resolve_id(&tasks, "  ").is_err());
    }
}
