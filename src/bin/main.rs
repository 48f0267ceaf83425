use aralia_orchestrator::{AskRequest, AskResponse, Assistant, Config};
use clap::Parser;
use std::io::{self, Read};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "aralia-ask", version, about = "Answer a question from Aralia open data")]
struct Cli {
    /// The question to answer (read from stdin when omitted)
    question: Option<String>,

    /// Retries per external call
    #[arg(long)]
    max_retries: Option<u32>,

    /// Per-call timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Sampling temperature for the model
    #[arg(long)]
    temperature: Option<f32>,

    /// Replace the default answer-writing instructions
    #[arg(long)]
    interpretation_prompt: Option<String>,

    /// Print the step trace and notes
    #[arg(short, long)]
    verbose: bool,
}

fn read_question(cli: &Cli) -> io::Result<String> {
    if let Some(q) = &cli.question {
        return Ok(q.clone());
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(buf.trim().to_string())
}

/// Verbose output is on when either the flag or VERBOSE asks for it.
fn verbose_output(cli: &Cli, config: &Config) -> bool {
    cli.verbose || config.verbose
}

/// Diagnostics printed to stderr after the answer.
fn report(response: &AskResponse, verbose: bool) -> String {
    let mut lines = Vec::new();
    if verbose {
        for step in &response.steps {
            lines.push(format!("step {:<10} {:?}", step.step.to_string(), step.status));
        }
        for note in &response.notes {
            lines.push(format!("note: {}", note));
        }
        lines.push(format!("tokens: {}", response.token_usage.total()));
    }
    for err in &response.errors {
        lines.push(format!("warning: {}", err));
    }
    lines.join("\n")
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    // The config moves into the assistant below.
    let verbose = verbose_output(&cli, &config);
    let default_level = if verbose {
        "aralia_orchestrator=debug,warn".to_string()
    } else {
        format!("aralia_orchestrator={},warn", config.log_level)
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let question = match read_question(&cli) {
        Ok(q) if !q.is_empty() => q,
        Ok(_) => {
            eprintln!("No question given");
            return ExitCode::from(2);
        }
        Err(e) => {
            eprintln!("Failed to read question from stdin: {}", e);
            return ExitCode::from(2);
        }
    };

    let assistant = match Assistant::from_config(config) {
        Ok(assistant) => assistant,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    let request = AskRequest {
        interpretation_prompt: cli.interpretation_prompt.clone(),
        temperature: cli.temperature,
        max_retries: cli.max_retries,
        timeout_seconds: cli.timeout,
        ..AskRequest::new(question)
    };

    match assistant.ask(request).await {
        Ok(response) => {
            info!(run_id = %response.run_id, digest = %response.digest, "Done");
            println!("{}", response.final_response);

            let diagnostics = report(&response, verbose);
            if !diagnostics.is_empty() {
                eprintln!("{}", diagnostics);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Question could not be answered");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
