use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Args as ClapArgs, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use winelist_admin::auth::{self, SessionStore};
use winelist_admin::config::{self, Config};
use winelist_admin::model::{
    BulkEntryUpdate, JobStatus, NewUser, RestaurantForm, StatusReport, UserRole, UserUpdate,
    WineEntryStatus, WineEntryUpdate,
};
use winelist_admin::poller::PollOutcome;
use winelist_admin::upload::UploadRequest;
use winelist_admin::workflow::{UploadState, UploadWorkflow};
use winelist_admin::{ApiClient, ApiError};

#[derive(Debug, Parser)]
#[command(author, version, about = "Admin client for restaurant wine-list parsing")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in with email and password and store the session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account and store the session
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        restaurant: Option<Uuid>,
    },
    /// Forget the stored session
    Logout,
    /// Show the current user and role
    Whoami,
    #[command(flatten)]
    Admin(AdminCommand),
}

/// Commands that require the `admin` role.
#[derive(Debug, Subcommand)]
enum AdminCommand {
    /// Restaurant and user counts
    Dashboard,
    #[command(subcommand)]
    Restaurants(RestaurantCmd),
    #[command(subcommand)]
    Users(UserCmd),
    #[command(subcommand)]
    Rules(RulesCmd),
    #[command(subcommand)]
    WineLists(WineListCmd),
    #[command(subcommand)]
    Entries(EntryCmd),
}

#[derive(Debug, Subcommand)]
enum RestaurantCmd {
    List,
    Show { id: Uuid },
    Create(RestaurantFields),
    Update {
        id: Uuid,
        #[command(flatten)]
        fields: RestaurantFields,
    },
    Delete { id: Uuid },
}

#[derive(Debug, ClapArgs)]
struct RestaurantFields {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    contact_email: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

impl From<RestaurantFields> for RestaurantForm {
    fn from(f: RestaurantFields) -> Self {
        RestaurantForm {
            name: f.name,
            contact_email: f.contact_email,
            notes: f.notes,
        }
    }
}

#[derive(Debug, Subcommand)]
enum UserCmd {
    List,
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "staff", value_parser = parse_role)]
        role: UserRole,
        #[arg(long)]
        restaurant: Option<Uuid>,
    },
    Update {
        id: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_parser = parse_role)]
        role: Option<UserRole>,
        #[arg(long)]
        restaurant: Option<Uuid>,
    },
    Delete { id: Uuid },
}

#[derive(Debug, Subcommand)]
enum RulesCmd {
    /// Print a restaurant's ruleset JSON
    Show { restaurant: Uuid },
    /// Replace a restaurant's ruleset with the JSON object in FILE
    Set {
        restaurant: Uuid,
        #[arg(long)]
        file: PathBuf,
    },
    /// Ask the backend to retrain the ruleset
    Train { restaurant: Uuid },
}

#[derive(Debug, Subcommand)]
enum WineListCmd {
    /// List uploaded files for a restaurant
    List {
        #[arg(long)]
        restaurant: Uuid,
    },
    Show { id: Uuid },
    Delete { id: Uuid },
    /// One-off status check
    Status { id: Uuid },
    /// Upload a PDF/JPG/PNG and follow processing until it finishes
    Upload {
        file: PathBuf,
        #[arg(long)]
        restaurant: Option<Uuid>,
        /// Date the list was in use (YYYY-MM-DD)
        #[arg(long)]
        parsed_date: Option<NaiveDate>,
        /// Return after the upload without polling
        #[arg(long)]
        no_wait: bool,
    },
}

#[derive(Debug, Subcommand)]
enum EntryCmd {
    /// List parsed entries of a wine-list file
    List { file_id: Uuid },
    Update {
        entry_id: Uuid,
        #[command(flatten)]
        fields: EntryFields,
    },
    /// Apply a JSON array of `{ "id": ..., <fields> }` objects
    Bulk {
        #[arg(long)]
        file: PathBuf,
    },
    Reject { entry_id: Uuid },
}

#[derive(Debug, ClapArgs)]
struct EntryFields {
    #[arg(long)]
    producer: Option<String>,
    #[arg(long)]
    cuvee: Option<String>,
    #[arg(long = "type")]
    wine_type: Option<String>,
    #[arg(long)]
    vintage: Option<String>,
    #[arg(long)]
    price: Option<String>,
    #[arg(long)]
    bottle_size: Option<String>,
    #[arg(long)]
    grape_variety: Option<String>,
    #[arg(long)]
    country: Option<String>,
    #[arg(long)]
    region: Option<String>,
    #[arg(long)]
    subregion: Option<String>,
    #[arg(long, value_parser = parse_entry_status)]
    status: Option<WineEntryStatus>,
}

impl From<EntryFields> for WineEntryUpdate {
    fn from(f: EntryFields) -> Self {
        WineEntryUpdate {
            producer: f.producer,
            cuvee: f.cuvee,
            wine_type: f.wine_type,
            vintage: f.vintage,
            price: f.price,
            bottle_size: f.bottle_size,
            grape_variety: f.grape_variety,
            country: f.country,
            region: f.region,
            subregion: f.subregion,
            status: f.status,
        }
    }
}

fn parse_role(s: &str) -> Result<UserRole, String> {
    s.parse()
}

fn parse_entry_status(s: &str) -> Result<WineEntryStatus, String> {
    s.parse()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        if let Some(api_err) = err.downcast_ref::<ApiError>() {
            if let Some(redirect) = api_err.redirect() {
                eprintln!("{} (redirect: {})", api_err.user_message(), redirect);
                std::process::exit(1);
            }
            eprintln!("error: {}", api_err.user_message());
        } else {
            eprintln!("error: {:#}", err);
        }
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let cfg = config::load(Some(args.config.as_path()))
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let client = ApiClient::new(cfg.base_url()?, cfg.request_timeout())?;
    let store = SessionStore::new(cfg.session_path());

    match args.command {
        Command::Login { email, password } => {
            let session = auth::login(&client, &email, &password).await?;
            store.save(&session).await?;
            println!("Logged in as {} ({})", session.user.email, session.user.role.as_str());
            Ok(())
        }
        Command::Register {
            email,
            password,
            name,
            restaurant,
        } => {
            let session = auth::register(&client, &email, &password, &name, restaurant).await?;
            store.save(&session).await?;
            println!("Registered {}", session.user.email);
            Ok(())
        }
        Command::Logout => {
            store.clear().await?;
            println!("Logged out");
            Ok(())
        }
        command => {
            let result = run_authenticated(command, &cfg, client, &store).await;
            if let Some(ApiError::LoginRequired { .. }) =
                result.as_ref().err().and_then(|e| e.downcast_ref::<ApiError>())
            {
                store.clear().await?;
            }
            result
        }
    }
}

async fn run_authenticated(
    command: Command,
    cfg: &Config,
    client: ApiClient,
    store: &SessionStore,
) -> Result<()> {
    let session = auth::active_session(&client, store).await?;
    let client = client.with_token(session.access_token.clone());

    let cmd = match command {
        Command::Admin(cmd) => cmd,
        Command::Whoami => {
            let me = client.me().await?;
            println!(
                "{} role={}",
                me.email.as_deref().unwrap_or(&session.user.email),
                me.role.as_str()
            );
            return Ok(());
        }
        Command::Login { .. } | Command::Register { .. } | Command::Logout => return Ok(()),
    };

    auth::require_admin(&client).await?;

    match cmd {
        AdminCommand::Dashboard => {
            let (restaurants, users) =
                tokio::try_join!(client.list_restaurants(), client.list_users())?;
            println!("Restaurants: {}", restaurants.len());
            println!("Users:       {}", users.len());
        }
        AdminCommand::Restaurants(cmd) => restaurants(&client, cmd).await?,
        AdminCommand::Users(cmd) => users(&client, cmd).await?,
        AdminCommand::Rules(cmd) => rules(&client, cmd).await?,
        AdminCommand::WineLists(cmd) => wine_lists(&client, cfg, cmd).await?,
        AdminCommand::Entries(cmd) => entries(&client, cmd).await?,
    }
    Ok(())
}

async fn restaurants(client: &ApiClient, cmd: RestaurantCmd) -> Result<()> {
    match cmd {
        RestaurantCmd::List => {
            for r in client.list_restaurants().await? {
                println!(
                    "{}  {}  {}",
                    r.id,
                    r.name,
                    r.contact_email.as_deref().unwrap_or("-")
                );
            }
        }
        RestaurantCmd::Show { id } => {
            let r = client.get_restaurant(id).await?;
            println!("{}", serde_json::to_string_pretty(&r)?);
        }
        RestaurantCmd::Create(fields) => {
            let r = client.create_restaurant(&fields.into()).await?;
            println!("Created restaurant {} ({})", r.name, r.id);
        }
        RestaurantCmd::Update { id, fields } => {
            let r = client.update_restaurant(id, &fields.into()).await?;
            println!("Updated restaurant {} ({})", r.name, r.id);
        }
        RestaurantCmd::Delete { id } => {
            client.delete_restaurant(id).await?;
            println!("Deleted restaurant {}", id);
        }
    }
    Ok(())
}

async fn users(client: &ApiClient, cmd: UserCmd) -> Result<()> {
    match cmd {
        UserCmd::List => {
            for u in client.list_users().await? {
                println!(
                    "{}  {}  {}  {}",
                    u.id,
                    u.email,
                    u.role.as_str(),
                    u.restaurant_id.map(|r| r.to_string()).unwrap_or_else(|| "-".into())
                );
            }
        }
        UserCmd::Create {
            email,
            password,
            name,
            role,
            restaurant,
        } => {
            let user = NewUser {
                email,
                password,
                name,
                role,
                restaurant_id: restaurant,
            };
            let u = client.create_user(&user).await?;
            println!("Created user {} ({})", u.email, u.id);
        }
        UserCmd::Update {
            id,
            name,
            role,
            restaurant,
        } => {
            let update = UserUpdate {
                name,
                role,
                restaurant_id: restaurant,
            };
            let u = client.update_user(id, &update).await?;
            println!("Updated user {} ({})", u.email, u.id);
        }
        UserCmd::Delete { id } => {
            client.delete_user(id).await?;
            println!("Deleted user {}", id);
        }
    }
    Ok(())
}

async fn rules(client: &ApiClient, cmd: RulesCmd) -> Result<()> {
    match cmd {
        RulesCmd::Show { restaurant } => {
            let ruleset = client.get_ruleset(restaurant).await?;
            println!("{}", serde_json::to_string_pretty(&ruleset.rules_json)?);
        }
        RulesCmd::Set { restaurant, file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let rules: serde_json::Value =
                serde_json::from_str(&raw).map_err(|err| anyhow!("Invalid JSON: {}", err))?;
            client.update_ruleset(restaurant, &rules).await?;
            println!("Ruleset saved");
        }
        RulesCmd::Train { restaurant } => {
            let detail = client.train_ruleset(restaurant).await?;
            println!("{}", detail);
        }
    }
    Ok(())
}

async fn wine_lists(client: &ApiClient, cfg: &Config, cmd: WineListCmd) -> Result<()> {
    match cmd {
        WineListCmd::List { restaurant } => {
            for wl in client.list_wine_lists(restaurant).await? {
                println!(
                    "{}  {}  {}  {}",
                    wl.id,
                    wl.filename,
                    wl.status,
                    wl.uploaded_at.map(|t| t.to_string()).unwrap_or_else(|| "-".into())
                );
            }
        }
        WineListCmd::Show { id } => {
            let wl = client.get_wine_list(id).await?;
            println!("{}", serde_json::to_string_pretty(&wl)?);
        }
        WineListCmd::Delete { id } => {
            client.delete_wine_list(id).await?;
            println!("Deleted wine list {}", id);
        }
        WineListCmd::Status { id } => {
            let report = client.status(id).await?;
            println!("{}", describe_status(&report));
        }
        WineListCmd::Upload {
            file,
            restaurant,
            parsed_date,
            no_wait,
        } => {
            let mut request = UploadRequest::new(file, restaurant);
            if let Some(date) = parsed_date {
                request = request.with_parsed_date(date);
            }
            upload(client.clone(), cfg, request, no_wait).await?;
        }
    }
    Ok(())
}

fn describe_status(report: &StatusReport) -> String {
    match &report.error {
        Some(err) => format!("{} ({})", report.job_status(), err),
        None => report.job_status().to_string(),
    }
}

async fn upload(client: ApiClient, cfg: &Config, request: UploadRequest, no_wait: bool) -> Result<()> {
    let workflow = UploadWorkflow::new(Arc::new(client), cfg.poll_interval());
    let bar = progress_bar();
    let render = tokio::spawn(render_state(workflow.subscribe(), bar.clone()));

    let outcome = match workflow.start(&request).await {
        Ok(handle) if no_wait => {
            handle.cancel();
            bar.finish_with_message("Uploaded; not waiting for processing");
            render.abort();
            return Ok(());
        }
        Ok(handle) => {
            let token = handle.cancellation();
            let wait = handle.wait();
            tokio::pin!(wait);
            tokio::select! {
                outcome = &mut wait => outcome,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted; cancelling status polling");
                    token.cancel();
                    wait.await
                }
            }
        }
        Err(err) => {
            bar.abandon_with_message(workflow.state().to_string());
            render.abort();
            return Err(err.into());
        }
    };

    // Let the renderer see the terminal state before reporting.
    let _ = render.await;
    report_outcome(outcome)
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template("{spinner} [{bar:30}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar
}

async fn render_state(mut rx: watch::Receiver<UploadState>, bar: ProgressBar) {
    loop {
        let state = rx.borrow_and_update().clone();
        match &state {
            UploadState::Uploading { percent } => bar.set_position(u64::from(*percent)),
            UploadState::Processing | UploadState::Parsing => {
                bar.set_position(100);
                bar.enable_steady_tick(Duration::from_millis(120));
            }
            _ => {}
        }
        bar.set_message(state.to_string());
        if state.is_terminal() {
            bar.finish();
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn report_outcome(outcome: PollOutcome) -> Result<()> {
    match outcome {
        PollOutcome::Finished(job) if job.status == JobStatus::Complete => {
            println!("{} processed ({})", job.filename, job.id);
            Ok(())
        }
        PollOutcome::Finished(job) => Err(anyhow!(
            "{} failed: {}",
            job.filename,
            job.error_message.unwrap_or_else(|| "Failed to process wine list".into())
        )),
        PollOutcome::Failed { redirect: Some(_), .. } => Err(ApiError::login_required().into()),
        PollOutcome::Failed { job, .. } => {
            error!(job_id = %job.id, "status polling failed");
            Err(anyhow!(
                "{}",
                job.error_message.unwrap_or_else(|| "Failed to check status".into())
            ))
        }
        PollOutcome::Cancelled(job) => {
            println!("Stopped following {} ({}); processing continues on the server", job.filename, job.id);
            Ok(())
        }
    }
}

async fn entries(client: &ApiClient, cmd: EntryCmd) -> Result<()> {
    match cmd {
        EntryCmd::List { file_id } => {
            for e in client.list_wine_entries(file_id).await? {
                println!(
                    "{}  {} | {} | {} | {} | {}",
                    e.id,
                    e.producer.as_deref().unwrap_or("-"),
                    e.cuvee.as_deref().unwrap_or("-"),
                    e.vintage.as_deref().unwrap_or("-"),
                    e.price.as_deref().unwrap_or("-"),
                    e.status.as_str()
                );
            }
        }
        EntryCmd::Update { entry_id, fields } => {
            let e = client.update_wine_entry(entry_id, &fields.into()).await?;
            println!("Updated entry {} ({})", e.id, e.status.as_str());
        }
        EntryCmd::Bulk { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let updates: Vec<BulkEntryUpdate> =
                serde_json::from_str(&raw).context("bulk file must be a JSON array of entries")?;
            let updated = client.bulk_update_wine_entries(&updates).await?;
            println!("Updated {} of {} entries", updated.len(), updates.len());
        }
        EntryCmd::Reject { entry_id } => {
            client.reject_wine_entry(entry_id).await?;
            println!("Rejected entry {}", entry_id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_includes_backend_error() {
        let failed = StatusReport {
            status: "failed".into(),
            error: Some("unreadable scan".into()),
        };
        assert_eq!(describe_status(&failed), "error (unreadable scan)");

        let parsing = StatusReport {
            status: "parsing".into(),
            error: None,
        };
        assert_eq!(describe_status(&parsing), "parsing");
    }

    #[test]
    fn cli_parses_upload_flags() {
        let args = Args::try_parse_from([
            "winelist-admin",
            "wine-lists",
            "upload",
            "list.pdf",
            "--restaurant",
            "7f1f6d1e-8c5e-4d55-9f0a-1d2a3b4c5d6e",
            "--parsed-date",
            "2024-05-01",
        ])
        .unwrap();
        match args.command {
            Command::Admin(AdminCommand::WineLists(WineListCmd::Upload {
                file,
                restaurant,
                parsed_date,
                no_wait,
            })) => {
                assert_eq!(file, PathBuf::from("list.pdf"));
                assert!(restaurant.is_some());
                assert_eq!(parsed_date, NaiveDate::from_ymd_opt(2024, 5, 1));
                assert!(!no_wait);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
