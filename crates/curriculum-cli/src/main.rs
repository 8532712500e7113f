use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};
use curriculum_core::diagnose::run_diagnostic;
use curriculum_core::{
    Config, ConfigFile, ConsoleEvent, ContentSelection, ContentType, CurriculumApi, HistoryEvent,
    HttpApi, JobId, ResumeRecord, SqliteStore, UploadConsole, UploadFile, UploadForm,
};
use tracing_subscriber::EnvFilter;

mod output;

use output::{JobProgress, Outcome};

type Console = UploadConsole<HttpApi, SqliteStore>;

/// Curriculum uploader - submit course material and follow its processing
#[derive(Parser, Debug)]
#[command(name = "curriculum", version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Base URL of the admin API
    #[arg(long, global = true, env = "CURRICULUM_API_BASE")]
    api_base: Option<String>,

    /// Organization the uploads belong to
    #[arg(long, global = true, env = "CURRICULUM_ORG_ID")]
    org: Option<String>,

    /// Bearer token for the admin API
    #[arg(long, global = true, env = "CURRICULUM_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the SQLite resumability store
    #[arg(long, global = true, env = "CURRICULUM_STORE")]
    store: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file or pasted text and follow its processing
    Upload(UploadArgs),
    /// Reattach to the organization's in-flight upload
    Resume,
    /// Show the current status of one upload
    Status {
        /// Upload identifier
        id: String,
    },
    /// List recent uploads for the organization
    History {
        /// Keep refreshing while other uploads are processing
        #[arg(long)]
        watch: bool,
    },
    /// Analyze an .imscc or .zip archive without uploading it
    Diagnose {
        /// Archive to analyze
        file: PathBuf,
    },
    /// Forget the organization's in-flight upload
    Reset,
}

#[derive(ClapArgs, Debug)]
struct UploadArgs {
    /// File to upload (.imscc, .zip, .pdf, .docx, .doc)
    #[arg(required_unless_present_any = ["text", "text_file"], conflicts_with_all = ["text", "text_file"])]
    file: Option<PathBuf>,

    /// Curriculum text to upload instead of a file
    #[arg(long, conflicts_with = "text_file")]
    text: Option<String>,

    /// Read the curriculum text from a file
    #[arg(long)]
    text_file: Option<PathBuf>,

    /// Course title
    #[arg(long)]
    title: Option<String>,

    /// File with one learning objective per line
    #[arg(long)]
    objectives: Option<PathBuf>,

    /// Comma-separated content categories to extract from an archive
    #[arg(long, value_delimiter = ',')]
    content_types: Vec<String>,

    /// Run the archive diagnostic before uploading
    #[arg(long)]
    diagnose: bool,

    /// Start the upload and exit without following it
    #[arg(long)]
    detach: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.verbose);
    if args.no_color {
        owo_colors::set_override(false);
    }

    let (config, store_path) = resolve_config(&args)?;
    let config = Arc::new(config);
    let api = Arc::new(HttpApi::new(&config)?);

    match args.command {
        Command::Upload(upload) => {
            let store = open_store(&store_path)?;
            let mut console = UploadConsole::new(api, store, config);
            run_upload(&mut console, upload).await
        }
        Command::Resume => {
            let store = open_store(&store_path)?;
            let mut console = UploadConsole::new(api, store, config.clone());
            match console.mount().await? {
                Some(job_id) => {
                    println!("Resuming curriculum job {}", job_id);
                    Ok(exit_code(follow(&mut console, &job_id).await))
                }
                None => {
                    println!(
                        "No upload in progress for organization {}",
                        config.organization_id
                    );
                    Ok(ExitCode::SUCCESS)
                }
            }
        }
        Command::Status { id } => {
            let job_id = JobId::new(id);
            let update = api
                .job_status(&job_id)
                .await
                .with_context(|| format!("could not fetch status of job {}", job_id))?;
            output::print_status(&job_id, &update);
            Ok(ExitCode::SUCCESS)
        }
        Command::History { watch } => {
            let store = open_store(&store_path)?;
            let mut console = UploadConsole::new(api, store, config);
            console
                .refresh_history()
                .await
                .context("could not load upload history")?;
            output::print_history(console.history().entries());
            if watch {
                watch_history(&mut console).await;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Diagnose { file } => {
            let file = UploadFile::from_path(&file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let report = run_diagnostic(api.as_ref(), &file).await?;
            output::print_report(&report, &ContentSelection::from_report(&report));
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset => {
            let store = open_store(&store_path)?;
            let record = ResumeRecord::new(store, config.resume_key());
            match record.load()? {
                Some(job_id) => {
                    record.clear()?;
                    println!("Forgot in-flight job {}", job_id);
                }
                None => println!("Nothing to reset"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Flags and environment over the config file over defaults.
fn resolve_config(args: &Args) -> anyhow::Result<(Config, PathBuf)> {
    let file = match &args.config {
        Some(path) => Some(ConfigFile::load(path)?),
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => Some(ConfigFile::load(&path)?),
            None => None,
        },
    };

    let mut config = Config::default();
    if let Some(file) = &file {
        file.apply_to(&mut config);
    }
    if let Some(base) = &args.api_base {
        config.api_base = base.clone();
    }
    if let Some(org) = &args.org {
        config.organization_id = org.clone();
    }
    if let Some(token) = &args.token {
        config.api_token = Some(token.clone());
    }
    config
        .validate()
        .context("set it with a flag, an environment variable or the config file")?;

    let store_path = match args
        .store
        .clone()
        .or_else(|| file.as_ref().and_then(|f| f.store_path.clone()))
    {
        Some(path) => path,
        None => dirs::data_dir()
            .context("no data directory on this platform; pass --store")?
            .join("curriculum-uploader")
            .join("resume.sqlite3"),
    };
    Ok((config, store_path))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("curriculum-uploader").join("config.toml"))
}

fn open_store(path: &Path) -> anyhow::Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(path)
        .with_context(|| format!("cannot open resumability store {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn run_upload(console: &mut Console, args: UploadArgs) -> anyhow::Result<ExitCode> {
    let mut form = build_form(&args)?;

    if args.diagnose {
        if form.file.is_none() {
            anyhow::bail!("--diagnose needs an .imscc or .zip file");
        }
        let report = console.diagnose(&mut form).await?;
        let selection = form.content_selection.clone().unwrap_or_default();
        output::print_report(&report, &selection);
    }
    if !args.content_types.is_empty() {
        apply_content_types(&mut form, &args.content_types)?;
    }

    let job_id = console.submit(&form).await?;
    output::print_started(&job_id);
    if args.detach {
        println!("Follow it later with `curriculum resume`.");
        return Ok(ExitCode::SUCCESS);
    }
    Ok(exit_code(follow(console, &job_id).await))
}

fn build_form(args: &UploadArgs) -> anyhow::Result<UploadForm> {
    let mut form = if let Some(path) = &args.file {
        let file = UploadFile::from_path(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        UploadForm::for_file(file)
    } else if let Some(path) = &args.text_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        UploadForm::for_text(text)
    } else {
        UploadForm::for_text(args.text.clone().unwrap_or_default())
    };

    if let Some(title) = &args.title {
        form.title = title.clone();
    }
    if let Some(path) = &args.objectives {
        form.learning_objectives = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        tracing::info!("{} learning objectives", form.objective_count());
    }
    Ok(form)
}

fn apply_content_types(form: &mut UploadForm, names: &[String]) -> anyhow::Result<()> {
    if !form.file.as_ref().is_some_and(UploadFile::is_container) {
        anyhow::bail!("--content-types only applies to .imscc and .zip archives");
    }
    let mut wanted = Vec::new();
    for name in names.iter().filter(|n| !n.trim().is_empty()) {
        match ContentType::parse(name) {
            Some(t) => wanted.push(t),
            None => anyhow::bail!(
                "unknown content type {:?} (expected one of: {})",
                name,
                ContentType::ALL.map(|t| t.as_str()).join(", ")
            ),
        }
    }
    let mut selection = form.content_selection.clone().unwrap_or_default();
    for content_type in ContentType::ALL {
        selection.set(content_type, wanted.contains(&content_type));
    }
    form.content_selection = Some(selection);
    Ok(())
}

/// Render the primary job until it finishes or Ctrl+C detaches from it.
async fn follow(console: &mut Console, job_id: &JobId) -> Outcome {
    let progress = JobProgress::new(job_id);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = console.next_event() => match event {
                Some(ConsoleEvent::Monitor(event)) => {
                    if let Some(outcome) = progress.update(&event) {
                        return outcome;
                    }
                }
                Some(ConsoleEvent::History(_)) => {}
                None => return Outcome::Detached,
            },
            _ = &mut ctrl_c => {
                progress.detach(job_id);
                println!("Detached; the upload keeps running. Resume with `curriculum resume`.");
                return Outcome::Detached;
            }
        }
    }
}

async fn watch_history(console: &mut Console) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = console.next_event() => match event {
                Some(ConsoleEvent::History(HistoryEvent::Refreshed { entries, .. })) => {
                    println!();
                    output::print_history(&entries);
                }
                Some(ConsoleEvent::History(HistoryEvent::Stopped { .. })) | None => return,
                Some(ConsoleEvent::Monitor(_)) => {}
            },
            _ = &mut ctrl_c => return,
        }
    }
}

fn exit_code(outcome: Outcome) -> ExitCode {
    match outcome {
        Outcome::Failed => ExitCode::FAILURE,
        Outcome::Approved | Outcome::Settled | Outcome::Detached => ExitCode::SUCCESS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn upload_requires_exactly_one_source() {
        assert!(Args::try_parse_from(["curriculum", "upload"]).is_err());
        assert!(Args::try_parse_from(["curriculum", "upload", "a.pdf", "--text", "x"]).is_err());
        let args = Args::try_parse_from([
            "curriculum",
            "upload",
            "course.imscc",
            "--content-types",
            "assignments,quizzes",
            "--org",
            "org-1",
        ])
        .unwrap();
        let Command::Upload(upload) = args.command else {
            panic!("expected upload");
        };
        assert_eq!(upload.content_types, vec!["assignments", "quizzes"]);
        assert_eq!(args.org.as_deref(), Some("org-1"));
    }

    #[test]
    fn explicit_content_types_replace_defaults() {
        let mut form = UploadForm::for_file(UploadFile::new("/tmp/c.zip", "c.zip", 10));
        apply_content_types(&mut form, &["quizzes".into(), " Pages ".into()]).unwrap();
        assert_eq!(
            form.content_types(),
            Some(vec![ContentType::Pages, ContentType::Quizzes])
        );

        assert!(apply_content_types(&mut form, &["videos".into()]).is_err());

        let mut pdf = UploadForm::for_file(UploadFile::new("/tmp/c.pdf", "c.pdf", 10));
        assert!(apply_content_types(&mut pdf, &["pages".into()]).is_err());
    }
}
