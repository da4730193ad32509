use std::path::PathBuf;

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    labrun_common::UserIdentity,
    labrun_containers::PackageManager,
};

use crate::app::App;

#[derive(Subcommand)]
pub enum SandboxAction {
    /// Create a writable sandbox from the base image.
    Create,
    /// Install packages into the open sandbox.
    Install {
        /// Package manager: pip, apt or conda.
        #[arg(long, short)]
        manager: PackageManager,
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Freeze the open sandbox into the user's custom image.
    Finalize,
    /// Build the custom image from a definition file.
    Build {
        definition: PathBuf,
    },
    /// Remove the custom image and any open sandbox.
    Delete,
    /// Show storage usage and build counts.
    Stats {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_sandbox(app: &App, user: &UserIdentity, action: SandboxAction) -> Result<()> {
    let pipeline = &app.pipeline;
    match action {
        SandboxAction::Create => {
            let created = pipeline.create_sandbox(user).await?;
            println!("Sandbox created: {}", created.path.display());
        },
        SandboxAction::Install { manager, packages } => {
            let report = pipeline.install_package(user, manager, &packages).await?;
            print!("{}", report.stdout);
            eprint!("{}", report.stderr);
            println!("Installed with {}: {}", report.manager, report.packages.join(", "));
        },
        SandboxAction::Finalize => {
            let built = pipeline.finalize_sandbox(user).await?;
            println!(
                "Image built: {} ({})",
                built.path.display(),
                human_bytes(built.size_bytes)
            );
        },
        SandboxAction::Build { definition } => {
            let text = tokio::fs::read_to_string(&definition)
                .await
                .with_context(|| format!("failed to read {}", definition.display()))?;
            let built = pipeline.build_from_definition(user, &text).await?;
            println!(
                "Image built: {} ({})",
                built.path.display(),
                human_bytes(built.size_bytes)
            );
        },
        SandboxAction::Delete => {
            let report = pipeline.delete_custom_container(user).await?;
            if !report.removed_image && !report.removed_sandbox {
                println!("Nothing to remove.");
            } else {
                if report.removed_image {
                    println!("Removed custom image.");
                }
                if report.removed_sandbox {
                    println!("Removed sandbox.");
                }
            }
        },
        SandboxAction::Stats { json } => {
            let stats = pipeline.get_stats(user).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Image:    {}", human_bytes(stats.image_bytes));
                println!(
                    "Sandbox:  {}{}",
                    human_bytes(stats.sandbox_bytes),
                    if stats.sandbox_open {
                        " (open)"
                    } else {
                        ""
                    }
                );
                println!(
                    "Total:    {} of {} ({:.1}%)",
                    human_bytes(stats.total_bytes),
                    human_bytes(stats.quota_bytes),
                    stats.quota_used_percent
                );
                println!(
                    "Builds:   {}/{} today",
                    stats.builds_today, stats.max_builds_per_day
                );
            }
        },
    }
    Ok(())
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
