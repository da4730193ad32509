use std::{path::PathBuf, time::Duration};

use {
    anyhow::Result,
    clap::Args,
    labrun_containers::ExecutionRequest,
};

use crate::app::{App, ProjectArgs, UserArgs};

#[derive(Args)]
pub struct ExecArgs {
    #[command(flatten)]
    user: UserArgs,
    #[command(flatten)]
    project: ProjectArgs,
    /// Timeout in seconds. Zero or unset uses the configured default.
    #[arg(long)]
    timeout: Option<u64>,
    /// Mount only the script, not the project workspace.
    #[arg(long)]
    no_workspace: bool,
    /// Discard stdout and stderr.
    #[arg(long)]
    no_capture: bool,
    /// Output the result as JSON.
    #[arg(long)]
    json: bool,
    /// Script path, absolute or relative to the project workspace.
    script: PathBuf,
    /// Arguments passed to the script.
    #[arg(last = true)]
    args: Vec<String>,
}

/// Run the script and exit with its return code.
pub async fn handle_exec(app: &App, args: ExecArgs) -> Result<()> {
    let user = args.user.identity()?;
    let project = args.project.project_ref(&user)?;

    let mut request = ExecutionRequest::new(args.script)
        .args(args.args)
        .bind_workspace(!args.no_workspace)
        .capture_output(!args.no_capture);
    if let Some(secs) = args.timeout {
        request = request.timeout(Duration::from_secs(secs));
    }

    let result = app.gateway.execute(&user, &project, &request).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.stdout);
        eprint!("{}", result.stderr);
        if !result.stderr.is_empty() && !result.stderr.ends_with('\n') {
            eprintln!();
        }
    }

    if !result.success {
        std::process::exit(if result.return_code == 0 {
            1
        } else {
            result.return_code
        });
    }
    Ok(())
}
