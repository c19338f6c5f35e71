use std::process::ExitCode;

use briefmatch::{
    ArtifactBundle, ConfigDb, DataDir, Error, FusedSearchEngine, RankService,
    Result, Settings,
    builder::FusionIndexBuilder,
    cli::{BuildArgs, Cli, Command, ConfigAction, EncoderKind},
    embedding::EncoderSpec,
    factor::ExtractedFactors,
    mcp,
    model_manager::{DEFAULT_MODEL_ID, MODEL_ENV_VAR},
    rank::{RankLimits, RankResponse},
    record::load_records,
};
use clap::Parser;
use serde_json::Value;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Exit status for quota exhaustion (`EX_TEMPFAIL`).
const EXIT_RETRY_LATER: u8 = 75;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("BRIEFMATCH_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_quota_exceeded() => {
            eprintln!("Quota exhausted, retry later: {e}");
            ExitCode::from(EXIT_RETRY_LATER)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;
    let settings = Settings::resolve(Some(&config_db))?;

    match cli.command {
        Command::Build(args) => cmd_build(&data_dir, &settings, &args)?,
        Command::Search(args) => {
            let service = open_service(&data_dir, &settings, true)?;
            let limit = args.limit.map(Value::from);
            let response =
                service.rank_brief(&args.brief, limit.as_ref(), args.diversity)?;
            print_response(&response, args.json)?;
        }
        Command::Rank(args) => {
            let service = open_service(&data_dir, &settings, false)?;
            let factors = ExtractedFactors {
                desc: args.desc,
                what: args.what,
                how: args.how,
                style: args.style,
            };
            let limit = args.limit.map(Value::from);
            let response =
                service.rank_factors(factors, limit.as_ref(), args.diversity)?;
            print_response(&response, args.json)?;
        }
        Command::Extract(args) => {
            let factors = settings.extractor()?.extract(&args.text)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&factors)?);
            } else {
                println!("desc:  {}", factors.desc);
                println!("what:  {}", factors.what);
                println!("how:   {}", factors.how);
                println!("style: {}", factors.style);
            }
        }
        Command::Probe(args) => {
            let engine = open_engine(&data_dir, &settings)?;
            let hits = engine.probe(args.factor, &args.text, args.count)?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!("{:>3}. {:.4}  #{} {}", i + 1, hit.score, hit.id, hit.name);
            }
        }
        Command::Status(args) => cmd_status(&data_dir, &settings, args.json)?,
        Command::Config { action } => cmd_config(&config_db, &settings, action)?,
        Command::Mcp => {
            let service = open_service(&data_dir, &settings, false)?;
            mcp::run_mcp(service)?;
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

fn open_engine(data_dir: &DataDir, settings: &Settings) -> Result<FusedSearchEngine> {
    let engine = FusedSearchEngine::open(
        &data_dir.artifacts_db(),
        settings.search_tuning(),
    )?;
    if engine.bundle().weights() != &settings.weights {
        warn!(
            "configured weights differ from the ones the artifacts were built \
             with; run `briefmatch build` to apply them"
        );
    }
    Ok(engine)
}

/// Load the engine and, when possible, the extractor. With `require_extractor`
/// a missing provider configuration is an error; otherwise brief queries fail
/// later and factor queries still work.
fn open_service(
    data_dir: &DataDir,
    settings: &Settings,
    require_extractor: bool,
) -> Result<RankService> {
    let engine = open_engine(data_dir, settings)?;
    let extractor = match settings.extractor() {
        Ok(extractor) => Some(extractor),
        Err(e) if require_extractor => return Err(e),
        Err(e) => {
            warn!(error = %e, "extraction provider unavailable");
            None
        }
    };
    Ok(RankService::new(engine, extractor, RankLimits::from(settings)))
}

fn cmd_build(
    data_dir: &DataDir,
    settings: &Settings,
    args: &BuildArgs,
) -> Result<()> {
    let records = load_records(&args.records)?;
    eprintln!(
        "Loaded {} records from {}",
        records.len(),
        args.records.display()
    );

    let spec = match args.encoder {
        EncoderKind::Hashing => EncoderSpec::hashing_default(),
        EncoderKind::Colbert => {
            let word_vectors = args.word_vectors.clone().ok_or_else(|| {
                Error::Config(
                    "--word-vectors is required with --encoder colbert".into(),
                )
            })?;
            let model_id = args
                .model
                .clone()
                .or_else(|| std::env::var(MODEL_ENV_VAR).ok())
                .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());
            EncoderSpec::Colbert {
                model_id,
                word_vectors,
            }
        }
    };
    let encoder = spec.instantiate()?;
    let extractor = settings.extractor()?;

    let report = FusionIndexBuilder::new(
        &extractor,
        encoder.as_ref(),
        spec,
        settings.weights.clone(),
    )
    .with_progress(!args.no_progress)
    .build_to(&records, &data_dir.artifacts_db())?;

    eprintln!(
        "Indexed {} records (fused dimension {})",
        report.records, report.fused_dim
    );
    for (factor, dim) in report.dims.iter() {
        eprintln!("  {factor}: {} x {dim}", report.records);
    }
    if report.empty_extractions > 0 {
        eprintln!(
            "  {} record(s) fell back to empty factors",
            report.empty_extractions
        );
    }
    eprintln!("Wrote {}", report.path.display());
    Ok(())
}

fn print_response(response: &RankResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    let g = &response.generated;
    println!(
        "Factors: desc={:?} what={:?} how={:?} style={:?}",
        g.desc, g.what, g.how, g.style
    );
    if response.results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, r) in response.results.iter().enumerate() {
        println!("{:>3}. {:.4}  #{} {}", i + 1, r.final_score, r.id, r.name);
        println!(
            "     full {:.3}  desc {:.3}  what {:.3}  how {:.3}  style {:.3}",
            r.full_score, r.desc_score, r.what_score, r.how_score, r.style_score
        );
        if let Some(studio) = &r.studio {
            println!("     studio: {studio}");
        }
    }
    println!("\nCandidates: {}", response.candidate_size);
    if !response.top_studios.is_empty() {
        println!("Top studios:");
        for s in &response.top_studios {
            println!("  {}: {} ({:.1}%)", s.name, s.count, s.ratio * 100.0);
        }
    }
    Ok(())
}

fn cmd_status(data_dir: &DataDir, settings: &Settings, json: bool) -> Result<()> {
    let path = data_dir.artifacts_db();
    let bundle = if data_dir.has_artifacts() {
        Some(ArtifactBundle::load(&path)?)
    } else {
        None
    };

    if json {
        let artifacts = bundle.as_ref().map(|b| {
            serde_json::json!({
                "path": path,
                "records": b.len(),
                "dims": b.dims(),
                "index_sizes": b.dims().map(|f, _| b.factor_index(f).len()),
                "fused_dim": b.fused().dim(),
                "weights": b.weights(),
                "encoder": b.encoder(),
            })
        });
        let status = serde_json::json!({
            "data_dir": data_dir.root(),
            "artifacts": artifacts,
            "llm_provider": settings.llm_provider.as_str(),
            "gemini_api_key": settings.get("gemini_api_key")?,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Data directory: {}", data_dir.root().display());
    match &bundle {
        Some(b) => {
            println!("Artifacts: {}", path.display());
            println!("Records: {}", b.len());
            println!("Fused dimension: {}", b.fused().dim());
            for (factor, dim) in b.dims().iter() {
                println!(
                    "  {factor}: {} vectors, dim {dim}, weight {}",
                    b.factor_index(factor).len(),
                    b.weights()[factor]
                );
            }
            println!("Encoder: {}", serde_json::to_string(b.encoder())?);
        }
        None => println!("Artifacts: not built (run `briefmatch build`)"),
    }
    println!("LLM provider: {}", settings.llm_provider);
    println!("Gemini API key: {}", settings.get("gemini_api_key")?);
    Ok(())
}

fn cmd_config(
    config_db: &ConfigDb,
    settings: &Settings,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Get { key } => println!("{}", settings.get(&key)?),
        ConfigAction::Set { key, value } => {
            Settings::check_persistable(&key, &value)?;
            config_db.set_setting(&key, value.trim())?;
            println!("Set {key} = {}", value.trim());
        }
        ConfigAction::Unset { key } => {
            if !config_db.remove_setting(&key)? {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key,
                });
            }
            println!("Removed {key}");
        }
        ConfigAction::List { json } => {
            let entries = settings.entries();
            if json {
                let map: serde_json::Map<String, Value> = entries
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), Value::String(v)))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (key, value) in entries {
                    println!("{key}\t{value}");
                }
            }
        }
    }
    Ok(())
}
