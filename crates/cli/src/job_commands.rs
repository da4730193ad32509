use std::path::PathBuf;

use {
    anyhow::Result,
    clap::Subcommand,
    labrun_containers::{JobStatus, scheduler::BatchOptions},
};

use crate::app::{App, ProjectArgs, UserArgs};

#[derive(Subcommand)]
pub enum JobAction {
    /// Submit a script as a batch job.
    Submit {
        #[command(flatten)]
        user: UserArgs,
        #[command(flatten)]
        project: ProjectArgs,
        #[arg(long)]
        job_name: Option<String>,
        #[arg(long)]
        partition: Option<String>,
        /// Wall-clock limit, e.g. "01:00:00".
        #[arg(long)]
        time: Option<String>,
        #[arg(long)]
        cpus: Option<u32>,
        /// Memory in GiB.
        #[arg(long)]
        mem_gb: Option<u32>,
        script: PathBuf,
    },
    /// Show the state of a submitted job.
    Status {
        job_id: String,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_job(app: &App, action: JobAction) -> Result<()> {
    match action {
        JobAction::Submit {
            user,
            project,
            job_name,
            partition,
            time,
            cpus,
            mem_gb,
            script,
        } => {
            let user = user.identity()?;
            let project = project.project_ref(&user)?;
            let opts = BatchOptions {
                job_name,
                partition,
                time_limit: time,
                cpus_per_task: cpus,
                mem_gb,
            };
            let job = app
                .gateway
                .submit_to_scheduler(&user, &project, &script, &opts)
                .await?;
            println!("Submitted job {} ({})", job.job_id, job.job_name);
        },
        JobAction::Status { job_id, json } => {
            let state = app.gateway.get_scheduler_job_status(&job_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else if state.status == JobStatus::NotFound {
                println!("Job {job_id} not found (finished jobs leave the queue).");
            } else {
                println!("Job:     {}", state.job_id);
                println!("Status:  {}", state.status);
                if let Some(ref runtime) = state.runtime {
                    println!("Runtime: {runtime}");
                }
                if let Some(ref node) = state.node {
                    println!("Node:    {node}");
                }
                if let Some(ref detail) = state.detail {
                    println!("Detail:  {detail}");
                }
            }
        },
    }
    Ok(())
}
