use fathom_core::bits::PullFn;
use fathom_core::config::FathomConfig;
use fathom_core::mutator::{Mutator, RandomMutator};
use fathom_core::{BitCursor, Cracker, Schema, SchemaDocument, Tree};

use clap::{Parser, Subcommand};
use log::{LevelFilter, debug, info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Schema document; overrides `[schema] path` in the config.
    #[clap(short, long, value_parser)]
    schema: Option<PathBuf>,
    /// Data model to use; defaults to the first model in the document.
    #[clap(short, long)]
    model: Option<String>,
    /// Log level (off, error, warn, info, debug, trace)
    #[clap(long, default_value = "warn")]
    log_level: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crack an input and print the resulting tree as JSON.
    Crack {
        /// Input file, or `-` to stream from stdin.
        input: PathBuf,
    },
    /// Generate the model's default instance.
    Generate {
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Crack an input, then write mutated but structurally consistent variants of it.
    Mutate {
        input: PathBuf,
        #[clap(short, long)]
        iterations: Option<u64>,
        #[clap(short, long)]
        output_dir: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<FathomConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            FathomConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("fathom.toml");
            if default_config_path.exists() {
                info!("No config file specified via CLI, loading default: {default_config_path:?}");
                FathomConfig::load_from_file(&default_config_path)
            } else {
                debug!("No config file given and no default fathom.toml, using built-in defaults");
                Ok(FathomConfig::default())
            }
        }
    }
}

fn load_schema(
    config: &FathomConfig,
    schema: Option<PathBuf>,
    model: Option<String>,
) -> Result<(Schema, String), anyhow::Error> {
    let settings = config.schema.as_ref();
    let path = schema
        .or_else(|| settings.map(|s| s.path.clone()))
        .ok_or_else(|| anyhow::anyhow!("No schema given: pass --schema or set [schema] path"))?;
    let schema = SchemaDocument::load_from_file(&path)?.build()?;
    let model = match model.or_else(|| settings.and_then(|s| s.model.clone())) {
        Some(model) => model,
        None => schema
            .model_names()
            .next()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Schema {path:?} defines no data models"))?,
    };
    info!(path:? = path, model = model.as_str(); "Loaded schema");
    Ok((schema, model))
}

fn stdin_source() -> PullFn {
    let mut stdin = std::io::stdin();
    Box::new(move |want| {
        let mut buf = vec![0u8; want];
        match stdin.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                buf
            }
            Err(e) => {
                warn!("Failed to read stdin: {e}");
                Vec::new()
            }
        }
    })
}

fn open_input(path: &Path, chunk: usize) -> Result<BitCursor, anyhow::Error> {
    if path == Path::new("-") {
        return Ok(BitCursor::streaming(Vec::new(), stdin_source()).with_chunk_size(chunk));
    }
    let data = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Failed to read input file at {:?}: {}", path, e))?;
    Ok(BitCursor::new(data))
}

fn write_output(path: Option<&Path>, bytes: &[u8]) -> Result<(), anyhow::Error> {
    match path {
        Some(path) => std::fs::write(path, bytes)
            .map_err(|e| anyhow::anyhow!("Failed to write output to {:?}: {}", path, e)),
        None => {
            let mut stdout = std::io::stdout();
            stdout.write_all(bytes)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn crack_input(
    cracker: &mut Cracker,
    schema: &Schema,
    model: &str,
    input: &Path,
) -> Result<Tree, anyhow::Error> {
    let mut cursor = open_input(input, cracker.settings().pull_chunk_bytes)?;
    let tree = cracker.crack(schema, model, &mut cursor)?;
    if let Some(left) = cursor.remaining_bits().filter(|bits| *bits > 0) {
        warn!(input:? = input, bits = left; "Input has bits after the model");
    }
    Ok(tree)
}

fn mutate(
    config: &FathomConfig,
    tree: &Tree,
    iterations: u64,
    output_dir: Option<&Path>,
) -> Result<(), anyhow::Error> {
    if let Some(dir) = output_dir {
        std::fs::create_dir_all(dir)?;
    }
    let mut rng = ChaCha8Rng::seed_from_u64(config.mutator.seed);
    let mut mutator: RandomMutator<ChaCha8Rng> = RandomMutator::default();
    let mut seen = HashSet::new();

    println!("Starting mutation loop for {iterations} iterations...");
    let start_time = Instant::now();
    for i in 0..iterations {
        let mutated = mutator.mutate(tree, &mut rng)?;
        let bytes = mutated.generate_bytes()?;
        let hash = format!("{:x}", md5::compute(&bytes));
        if !seen.insert(hash.clone()) {
            continue;
        }
        debug!(iteration = i, hash = hash.as_str(), len = bytes.len(); "New variant");
        if let Some(dir) = output_dir {
            std::fs::write(dir.join(format!("{hash}.bin")), &bytes)?;
        }
    }
    println!(
        "Mutation loop finished in {:.2?}. Unique variants: {}",
        start_time.elapsed(),
        seen.len()
    );
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let log_level = LevelFilter::from_str(&cli.log_level).unwrap_or_else(|_| {
        eprintln!("Invalid log level: {}. Using 'warn' instead.", cli.log_level);
        LevelFilter::Warn
    });
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(log_level)
        .init();

    let config = load_config(cli.config_file)?;
    debug!("Effective configuration: {config:?}");
    let (schema, model) = load_schema(&config, cli.schema, cli.model)?;
    let mut cracker = Cracker::new(config.cracker.clone());

    match cli.command {
        Command::Crack { input } => {
            let tree = crack_input(&mut cracker, &schema, &model, &input)?;
            println!("{}", tree.to_json()?);
        }
        Command::Generate { output } => {
            let tree = Tree::with_defaults(&schema, &model)?;
            write_output(output.as_deref(), &tree.generate_bytes()?)?;
        }
        Command::Mutate {
            input,
            iterations,
            output_dir,
        } => {
            let tree = crack_input(&mut cracker, &schema, &model, &input)?;
            let iterations = iterations.unwrap_or(config.mutator.iterations);
            mutate(&config, &tree, iterations, output_dir.as_deref())?;
        }
    }
    Ok(())
}
