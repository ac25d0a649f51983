use crate::camera::FileCamera;
use crate::persistence::RecipeStore;
use crate::providers::RecipeAi;
use crate::session::{CookingSession, SessionError, ValidationOutcome};
use crate::types::{StepKind, ValidationStatus};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// One parsed line of the cooking shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Help,
    Steps,
    Done(usize),
    Validate { position: usize, image: PathBuf },
    Notice,
    Dismiss,
    Progress,
    Quit,
    Invalid(String),
}

/// Parses a shell line. Positions are 1-based as shown by `/steps`.
/// `:` works as an alias for the leading `/`.
pub fn parse_command(line: &str) -> Option<ShellCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let body = line
        .strip_prefix('/')
        .or_else(|| line.strip_prefix(':'))
        .unwrap_or(line);
    let mut parts = body.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    let command = match (name, args.as_slice()) {
        ("help", _) => ShellCommand::Help,
        ("steps", _) => ShellCommand::Steps,
        ("notice", _) => ShellCommand::Notice,
        ("dismiss", _) => ShellCommand::Dismiss,
        ("progress", _) => ShellCommand::Progress,
        ("quit" | "exit", _) => ShellCommand::Quit,
        ("done", [n]) => match parse_position(n) {
            Some(position) => ShellCommand::Done(position),
            None => ShellCommand::Invalid("usage: /done <step-number>".to_string()),
        },
        ("done", _) => ShellCommand::Invalid("usage: /done <step-number>".to_string()),
        ("validate", [n, path @ ..]) if !path.is_empty() => match parse_position(n) {
            Some(position) => ShellCommand::Validate {
                position,
                image: PathBuf::from(path.join(" ")),
            },
            None => ShellCommand::Invalid("usage: /validate <step-number> <image-path>".to_string()),
        },
        ("validate", _) => {
            ShellCommand::Invalid("usage: /validate <step-number> <image-path>".to_string())
        }
        (other, _) => ShellCommand::Invalid(format!("unknown command: {other}; try /help")),
    };
    Some(command)
}

fn parse_position(raw: &str) -> Option<usize> {
    raw.parse::<usize>().ok().filter(|n| *n > 0)
}

pub async fn run_cooking_repl<A, S>(session: &mut CookingSession<A, S>) -> anyhow::Result<()>
where
    A: RecipeAi,
    S: RecipeStore,
{
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    run_cooking_shell(session, &mut stdin.lock(), &mut stdout).await
}

/// Drives a session from line input until `/quit` or end of input.
/// Leaving an unfinished session marks it abandoned.
pub async fn run_cooking_shell<A, S, R, W>(
    session: &mut CookingSession<A, S>,
    input: &mut R,
    out: &mut W,
) -> anyhow::Result<()>
where
    A: RecipeAi,
    S: RecipeStore,
    R: BufRead,
    W: Write,
{
    writeln!(out, "ChefQuest cooking shell")?;
    writeln!(out, "Type /help for commands. Use /quit to leave.")?;
    print_steps(session, out)?;

    loop {
        write!(out, "cook> ")?;
        out.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        let Some(command) = parse_command(&line) else {
            continue;
        };
        match command {
            ShellCommand::Help => print_help(out)?,
            ShellCommand::Steps => print_steps(session, out)?,
            ShellCommand::Quit => break,
            ShellCommand::Invalid(message) => writeln!(out, "{message}")?,
            ShellCommand::Notice => match session.active_notice() {
                Some(message) => writeln!(out, "notice: {message}")?,
                None => writeln!(out, "no active notice")?,
            },
            ShellCommand::Dismiss => {
                session.dismiss_notice();
                writeln!(out, "notice dismissed")?;
            }
            ShellCommand::Progress => print_progress(session, out)?,
            ShellCommand::Done(position) => {
                let Some(id) = step_at(session, position, out)? else {
                    continue;
                };
                match session.toggle_completion(id).await {
                    Ok(true) => writeln!(out, "step {position} done")?,
                    Ok(false) => writeln!(out, "step {position} reopened")?,
                    Err(e) => print_shell_error(out, e)?,
                }
                finish_if_complete(session, out)?;
            }
            ShellCommand::Validate { position, image } => {
                let Some(id) = step_at(session, position, out)? else {
                    continue;
                };
                writeln!(out, "checking step {position}...")?;
                let camera = FileCamera::new(image);
                match session.capture_and_validate(id, &camera).await {
                    Ok(outcome) => print_outcome(out, &outcome)?,
                    Err(e) => print_shell_error(out, e)?,
                }
                finish_if_complete(session, out)?;
            }
        }
    }

    if !session.is_complete() {
        session.abandon().await;
    }
    Ok(())
}

fn step_at<A, S, W>(
    session: &CookingSession<A, S>,
    position: usize,
    out: &mut W,
) -> io::Result<Option<crate::types::StepId>>
where
    A: RecipeAi,
    S: RecipeStore,
    W: Write,
{
    match session.steps().get(position - 1) {
        Some(step) => Ok(Some(step.id)),
        None => {
            writeln!(
                out,
                "no step {position}; the recipe has {} steps",
                session.steps().len()
            )?;
            Ok(None)
        }
    }
}

fn print_steps<A, S, W>(session: &CookingSession<A, S>, out: &mut W) -> io::Result<()>
where
    A: RecipeAi,
    S: RecipeStore,
    W: Write,
{
    for (index, step) in session.steps().iter().enumerate() {
        let status = session.status(step.id).cloned().unwrap_or_default();
        let mark = if status.completed {
            "[x]"
        } else if session.is_unlocked(index) {
            "[ ]"
        } else {
            "[-]"
        };
        let tag = match step.kind {
            StepKind::Original => "",
            StepKind::Corrective => " (corrective)",
            StepKind::Modified => " (modified)",
        };
        writeln!(
            out,
            "{mark} {:>2}. step {}{tag}: {}",
            index + 1,
            step.label,
            step.instruction
        )?;
        if let Some(original) = &step.original_instruction {
            writeln!(out, "        was: {original}")?;
        }
        if status.validated {
            writeln!(out, "        checked by photo")?;
        }
    }
    Ok(())
}

fn print_progress<A, S, W>(session: &CookingSession<A, S>, out: &mut W) -> io::Result<()>
where
    A: RecipeAi,
    S: RecipeStore,
    W: Write,
{
    let progress = session.progress();
    writeln!(
        out,
        "{}/{} steps completed",
        progress.completed, progress.total
    )
}

fn finish_if_complete<A, S, W>(session: &CookingSession<A, S>, out: &mut W) -> io::Result<()>
where
    A: RecipeAi,
    S: RecipeStore,
    W: Write,
{
    if session.is_complete() {
        writeln!(out, "all steps complete. enjoy your meal!")?;
    }
    Ok(())
}

fn print_outcome<W: Write>(out: &mut W, outcome: &ValidationOutcome) -> io::Result<()> {
    let verdict = match outcome.verdict.status {
        ValidationStatus::Pass => "passed",
        ValidationStatus::Fail => "failed",
        ValidationStatus::Uncertain => "uncertain",
    };
    writeln!(
        out,
        "step {} {verdict} (confidence {})",
        outcome.label,
        outcome.verdict.confidence.as_str()
    )?;
    writeln!(out, "{}", outcome.text.trim())?;
    if let Some(adjustment) = &outcome.adjustment {
        if adjustment.corrective_added > 0 || adjustment.modified > 0 {
            writeln!(
                out,
                "steps updated: {} added, {} changed",
                adjustment.corrective_added, adjustment.modified
            )?;
        }
        writeln!(out, "notice: {}", adjustment.message)?;
    }
    Ok(())
}

fn print_shell_error<W: Write>(out: &mut W, err: SessionError) -> io::Result<()> {
    match err {
        SessionError::Locked { label } => {
            writeln!(out, "step {label} is locked; finish the previous step first")
        }
        SessionError::AlreadyValidated { label } => {
            writeln!(out, "step {label} is already checked")
        }
        SessionError::Camera(e) => {
            writeln!(out, "camera error: {e}")?;
            writeln!(out, "nothing changed; try another photo or use /done")
        }
        SessionError::Validation(e) => {
            writeln!(out, "could not check the photo: {e}")?;
            writeln!(out, "nothing changed; try again in a moment")
        }
        other => writeln!(out, "error: {other}"),
    }
}

fn print_help<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "Cooking Shell Commands")?;
    writeln!(out, "  /help                         show this help")?;
    writeln!(out, "  /steps                        list steps and their state")?;
    writeln!(out, "  /done <n>                     toggle step n as done")?;
    writeln!(out, "  /validate <n> <image-path>    check step n with a photo")?;
    writeln!(out, "  /notice                       show the current adjustment notice")?;
    writeln!(out, "  /dismiss                      hide the current notice")?;
    writeln!(out, "  /progress                     show completed/total")?;
    writeln!(out, "  /quit | /exit                 leave the kitchen")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryStore, SessionStatus};
    use crate::providers::MockProvider;
    use std::io::Cursor;
    use std::sync::Arc;

    #[test]
    fn parses_commands_and_aliases() {
        assert_eq!(parse_command("  "), None);
        assert_eq!(parse_command("/help"), Some(ShellCommand::Help));
        assert_eq!(parse_command(":steps"), Some(ShellCommand::Steps));
        assert_eq!(parse_command("/exit"), Some(ShellCommand::Quit));
        assert_eq!(parse_command("/done 2"), Some(ShellCommand::Done(2)));
        assert_eq!(
            parse_command("/validate 3 photos/my pan.jpg"),
            Some(ShellCommand::Validate {
                position: 3,
                image: PathBuf::from("photos/my pan.jpg"),
            })
        );
    }

    #[test]
    fn rejects_bad_positions() {
        assert!(matches!(
            parse_command("/done 0"),
            Some(ShellCommand::Invalid(_))
        ));
        assert!(matches!(
            parse_command("/done two"),
            Some(ShellCommand::Invalid(_))
        ));
        assert!(matches!(
            parse_command("/validate 1"),
            Some(ShellCommand::Invalid(_))
        ));
        assert!(matches!(
            parse_command("/fry"),
            Some(ShellCommand::Invalid(_))
        ));
    }

    async fn run(script: &str) -> (String, Arc<MemoryStore>, usize) {
        let ai = MockProvider::new();
        let recipe = ai
            .get_recipe_details("omelet", "Omelet", "en")
            .await
            .expect("details");
        let store = Arc::new(MemoryStore::new());
        let mut session = CookingSession::start(&recipe, ai, store.clone()).await;
        let mut input = Cursor::new(script.as_bytes().to_vec());
        let mut out = Vec::new();
        run_cooking_shell(&mut session, &mut input, &mut out)
            .await
            .expect("shell");
        let completed = session.progress().completed;
        (String::from_utf8(out).expect("utf8"), store, completed)
    }

    #[tokio::test]
    async fn shell_completes_steps_in_order() {
        let (out, store, completed) = run("/done 2\n/done 1\n/done 2\n/done 3\n/quit\n").await;
        assert!(out.contains("step 2 is locked"));
        assert!(out.contains("all steps complete"));
        assert_eq!(completed, 3);
        assert_eq!(store.sessions().await[0].status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn leaving_early_abandons_the_session() {
        let (out, store, completed) = run("/done 1\n/progress\n").await;
        assert!(out.contains("1/3 steps completed"));
        assert_eq!(completed, 1);
        assert_eq!(store.sessions().await[0].status, SessionStatus::Abandoned);
    }

    #[tokio::test]
    async fn missing_photo_reports_camera_error() {
        let (out, _store, completed) = run("/validate 1 /no/such/photo.jpg\n/validate 9 x.jpg\n").await;
        assert!(out.contains("camera error"));
        assert!(out.contains("no step 9"));
        assert_eq!(completed, 0);
    }
}
