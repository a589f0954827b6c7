use clap::error::ErrorKind;
use clap::Parser;
use hdt_cli::cli::{init_tracing, Cli, Commands};
use hdt_cli::constants::{
    DEFAULT_TIMEOUT_MS, ENV_HDT_TIMEOUT_MS, EXIT_COMPILE, EXIT_GENDOC, EXIT_OK, EXIT_RUN_FAILED,
    EXIT_USAGE,
};
use hdt_cli::descriptor::NameSet;
use hdt_cli::engine::{self, Compiled};
use hdt_cli::error::Error;
use hdt_cli::loader::{self, Project};
use hdt_cli::runtime::hooks::{FcnRegistry, HookRegistry};
use hdt_cli::runtime::http::ReqwestDispatch;
use hdt_cli::runtime::{RunOptions, Runtime};
use hdt_cli::swagger;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_OK,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    init_tracing(cli.log, cli.verbose);
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let project = match loader::load_dir(&cli.indir) {
        Ok(project) => project,
        Err(errors) => {
            report_errors(&errors);
            return match cli.command {
                Commands::Gendoc => EXIT_GENDOC,
                _ => EXIT_COMPILE,
            };
        }
    };

    match cli.command {
        Commands::Gendoc => gendoc(&cli, &project),
        Commands::Compile => match compile(&cli, &project) {
            Ok(compiled) => {
                print!("{}", compiled.plan.render());
                EXIT_OK
            }
            Err(code) => code,
        },
        Commands::Run => match compile(&cli, &project) {
            Ok(compiled) => execute(compiled).await,
            Err(code) => code,
        },
    }
}

fn gendoc(cli: &Cli, project: &Project) -> i32 {
    let outdir = cli.outdir.clone().unwrap_or_else(|| cli.indir.clone());
    let result = swagger::emit(project).and_then(|documents| {
        std::fs::create_dir_all(&outdir)?;
        for (name, doc) in documents {
            let path = outdir.join(&name);
            std::fs::write(&path, serde_json::to_string_pretty(&doc)?)?;
            println!("wrote {}", path.display());
        }
        Ok(())
    });
    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("documentation generation failed: {e}");
            EXIT_GENDOC
        }
    }
}

fn compile(cli: &Cli, project: &Project) -> Result<Compiled, i32> {
    let extra_vars = match gather_extra_vars(cli) {
        Ok(vars) => vars,
        Err(e) => {
            report_errors(std::slice::from_ref(&e));
            return Err(EXIT_COMPILE);
        }
    };
    engine::compile_project(project, &extra_vars, &cli.tests, &NameSet::new()).map_err(|errors| {
        report_errors(&errors);
        EXIT_COMPILE
    })
}

fn gather_extra_vars(cli: &Cli) -> Result<IndexMap<String, Value>, Error> {
    let mut vars = loader::load_var_files(&cli.config)?;
    for (name, value) in loader::parse_var_overrides(&cli.vars)? {
        vars.insert(name, value);
    }
    Ok(vars)
}

async fn execute(compiled: Compiled) -> i32 {
    tracing::debug!(plan = %compiled.plan.render(), "execution plan");
    let client = match ReqwestDispatch::new() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("{e}");
            return EXIT_RUN_FAILED;
        }
    };
    let timeout = std::env::var(ENV_HDT_TIMEOUT_MS)
        .ok()
        .and_then(|ms| ms.parse().ok())
        .unwrap_or(DEFAULT_TIMEOUT_MS);

    let runtime = Runtime::new(
        compiled.plan,
        client,
        HookRegistry::new(),
        FcnRegistry::new(),
        RunOptions {
            timeout: Duration::from_millis(timeout),
        },
    );
    let report = runtime.run(&compiled.env).await;
    println!(
        "{} passed, {} failed in {:.2}s",
        report.passed,
        report.failed,
        report.duration.as_secs_f64()
    );
    if report.ok() {
        EXIT_OK
    } else {
        EXIT_RUN_FAILED
    }
}

fn report_errors(errors: &[Error]) {
    for error in errors {
        eprintln!("{error}");
    }
    eprintln!("{} error(s)", errors.len());
}
