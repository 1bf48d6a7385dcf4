mod server;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::http::HeaderName;
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use exam_quota::{
    DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL, DEFAULT_QUOTA_DOCUMENT, Difficulty, EssayItem,
    ExamAi, ExamAiError, GeminiTransport, KeyLimiter, KeyRoster, QuestionRequest, QuestionType,
    QuotaDocument, QuotaLimits, QuotaStore, SqliteKeyCache, SqliteQuotaStore, now_millis,
    open_pool,
};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::server::{AppState, ForwardAuthConfig};

#[derive(Debug, Parser)]
#[command(author, version, about = "Quota-aware Gemini client for exam generation and grading")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate exam questions and print them as JSON.
    Generate(GenerateArgs),
    /// Grade essay answers read from a JSON file.
    Grade(GradeArgs),
    /// Administer the API keys stored in the quota document.
    Keys(KeysArgs),
    /// Start the HTTP API used by the exam screens.
    Serve(ServeArgs),
}

/// Storage and provider settings shared by every subcommand.
#[derive(Debug, Args)]
struct AiArgs {
    /// SQLite database path holding the quota document and the local key cache.
    #[arg(long, env = "EXAM_AI_DB_PATH", default_value = "exam_quota.db")]
    db_path: String,

    /// Quota document identifier (collection/id).
    #[arg(long, env = "EXAM_AI_QUOTA_DOCUMENT", default_value = DEFAULT_QUOTA_DOCUMENT)]
    quota_document: String,

    /// Override the Gemini API base URL.
    #[arg(long, env = "EXAM_AI_ENDPOINT", default_value = DEFAULT_GEMINI_ENDPOINT)]
    endpoint: String,

    /// Gemini model name.
    #[arg(long, env = "EXAM_AI_MODEL", default_value = DEFAULT_GEMINI_MODEL)]
    model: String,

    /// Tokens per minute a key may consume.
    #[arg(
        long,
        env = "EXAM_AI_TPM_LIMIT",
        default_value_t = QuotaLimits::default().tokens_per_minute
    )]
    tpm_limit: u64,

    /// Requests per minute a key may serve.
    #[arg(
        long,
        env = "EXAM_AI_RPM_LIMIT",
        default_value_t = QuotaLimits::default().requests_per_minute
    )]
    rpm_limit: u64,

    /// Requests per day a key may serve.
    #[arg(
        long,
        env = "EXAM_AI_RPD_LIMIT",
        default_value_t = QuotaLimits::default().requests_per_day
    )]
    rpd_limit: u64,

    /// Timeout applied to each Gemini request, in seconds.
    #[arg(long, env = "EXAM_AI_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,
}

impl AiArgs {
    fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            tokens_per_minute: self.tpm_limit,
            requests_per_minute: self.rpm_limit,
            requests_per_day: self.rpd_limit,
        }
    }
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[command(flatten)]
    ai: AiArgs,

    /// School subject, e.g. "Matemática".
    #[arg(long)]
    subject: String,

    /// Topic within the subject.
    #[arg(long)]
    topic: String,

    /// facil, medio or dificil.
    #[arg(long, default_value = "medio")]
    difficulty: Difficulty,

    /// Number of questions (1-10).
    #[arg(short = 'n', long, default_value_t = 5)]
    count: u8,

    /// objetiva, discursiva or mista.
    #[arg(long = "type", default_value = "objetiva")]
    question_type: QuestionType,

    /// Extra instructions appended to the prompt verbatim.
    #[arg(long)]
    instructions: Option<String>,

    /// Preferred API key for this call.
    #[arg(long, env = "EXAM_AI_KEY", hide_env_values = true)]
    key: Option<String>,
}

#[derive(Debug, Parser)]
struct GradeArgs {
    #[command(flatten)]
    ai: AiArgs,

    /// JSON file with an array of {id, prompt, referenceAnswer, studentAnswer}.
    items: PathBuf,

    /// Preferred API key for this call.
    #[arg(long, env = "EXAM_AI_KEY", hide_env_values = true)]
    key: Option<String>,
}

#[derive(Debug, Parser)]
struct KeysArgs {
    #[command(flatten)]
    ai: AiArgs,

    #[command(subcommand)]
    action: KeysCommand,
}

#[derive(Debug, Subcommand)]
enum KeysCommand {
    /// Show per-key usage without revealing the keys.
    List,
    /// Register keys with zeroed counters; existing keys are left untouched.
    Add {
        /// Comma separated API keys or repeat the argument.
        #[arg(value_delimiter = ',', required = true)]
        keys: Vec<String>,
    },
    /// Print the quota document as `{"iaToken": {...}}`.
    Export,
    /// Merge a previously exported quota document.
    Import {
        /// Path to the JSON document.
        file: PathBuf,
    },
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[command(flatten)]
    ai: AiArgs,

    /// Address to bind the HTTP server to.
    #[arg(long, env = "EXAM_AI_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to bind the HTTP server to.
    #[arg(long, env = "EXAM_AI_PORT", default_value_t = 8080)]
    port: u16,

    /// Header carrying the authenticated user, set by the reverse proxy.
    #[arg(long, env = "FORWARD_AUTH_HEADER")]
    forward_auth_header: Option<String>,

    /// User header value that grants admin access.
    #[arg(long, env = "FORWARD_AUTH_ADMIN_VALUE", hide_env_values = true)]
    forward_auth_admin_value: Option<String>,

    /// Header carrying a display name.
    #[arg(long, env = "FORWARD_AUTH_NICKNAME_HEADER")]
    forward_auth_nickname_header: Option<String>,

    /// Treat every caller as this admin user (local development only).
    #[arg(long, env = "ADMIN_AUTH_OVERRIDE_NAME")]
    admin_override_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "exam_quota=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Generate(args) => run_generate(args).await,
        Command::Grade(args) => run_grade(args).await,
        Command::Keys(args) => run_keys(args).await,
        Command::Serve(args) => return run_server(args).await,
    };

    if let Err(err) = result {
        report_error(&err);
        std::process::exit(1);
    }
    Ok(())
}

struct Services {
    ai: ExamAi,
    roster: KeyRoster,
}

async fn connect(args: &AiArgs) -> Result<Services, ExamAiError> {
    let pool = open_pool(&args.db_path).await?;
    let store: Arc<dyn QuotaStore> =
        Arc::new(SqliteQuotaStore::new(pool.clone(), &args.quota_document).await?);
    let cache = Arc::new(SqliteKeyCache::new(pool).await?);

    let mut client = reqwest::Client::builder();
    if let Some(secs) = args.timeout_secs {
        client = client.timeout(Duration::from_secs(secs));
    }
    let client = client.build().map_err(|err| ExamAiError::RequestFailed {
        status: None,
        message: format!("cannot build HTTP client: {err}"),
    })?;
    let transport = GeminiTransport::with_client(client, &args.endpoint, &args.model)?;

    let limits = args.limits();
    Ok(Services {
        ai: ExamAi::new(transport, store.clone(), cache, limits),
        roster: KeyRoster::new(store, KeyLimiter::new(limits)),
    })
}

async fn run_generate(args: GenerateArgs) -> Result<(), ExamAiError> {
    let services = connect(&args.ai).await?;
    let request = QuestionRequest {
        subject: args.subject,
        topic: args.topic,
        difficulty: args.difficulty,
        count: args.count,
        question_type: args.question_type,
        extra_instructions: args.instructions,
    };
    let questoes = services
        .ai
        .generate_questions(&request, args.key.as_deref())
        .await?;
    println!("{}", serde_json::to_string_pretty(&json!({ "questoes": questoes }))?);
    Ok(())
}

async fn run_grade(args: GradeArgs) -> Result<(), ExamAiError> {
    let raw = std::fs::read_to_string(&args.items).map_err(|err| {
        ExamAiError::InvalidRequest(format!("cannot read {}: {err}", args.items.display()))
    })?;
    let items: Vec<EssayItem> = serde_json::from_str(&raw)?;

    let services = connect(&args.ai).await?;
    let resultados = services
        .ai
        .grade_essay_answers(&items, args.key.as_deref())
        .await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "resultados": resultados }))?
    );
    Ok(())
}

async fn run_keys(args: KeysArgs) -> Result<(), ExamAiError> {
    let services = connect(&args.ai).await?;
    match args.action {
        KeysCommand::List => {
            let report = services.roster.usage_report(now_millis()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        KeysCommand::Add { keys } => {
            let mut added = 0;
            for key in keys.iter().map(|key| key.trim()).filter(|key| !key.is_empty()) {
                services.roster.register(key).await?;
                added += 1;
            }
            println!("registered {added} key(s)");
        }
        KeysCommand::Export => {
            let document = services.roster.export_document().await?;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        KeysCommand::Import { file } => {
            let raw = std::fs::read_to_string(&file).map_err(|err| {
                ExamAiError::InvalidRequest(format!("cannot read {}: {err}", file.display()))
            })?;
            let document: QuotaDocument = serde_json::from_str(&raw)?;
            let imported = services.roster.import_document(&document).await?;
            println!("imported {imported} key(s)");
        }
    }
    Ok(())
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let services = connect(&args.ai).await?;
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    let user_header = args
        .forward_auth_header
        .as_deref()
        .map(HeaderName::try_from)
        .transpose()?;
    let nickname_header = args
        .forward_auth_nickname_header
        .as_deref()
        .map(HeaderName::try_from)
        .transpose()?;
    let forward_auth = ForwardAuthConfig::new(
        user_header,
        args.forward_auth_admin_value,
        nickname_header,
        args.admin_override_name,
    );

    server::serve(
        addr,
        AppState {
            ai: services.ai,
            roster: services.roster,
            forward_auth,
        },
    )
    .await
}

fn report_error(err: &ExamAiError) {
    eprintln!("error: {err}");
    match err {
        ExamAiError::RequestFailed {
            status: Some(status),
            ..
        } => {
            eprintln!("  status: {status}");
        }
        ExamAiError::MalformedAiResponse(cause) => {
            eprintln!("  cause: {cause:?}");
        }
        ExamAiError::Database(db_err) => {
            eprintln!("  database: {db_err}");
        }
        _ => {}
    }
}
