use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facefind_core::guard::{self, UploadOutcome};
use facefind_core::person_search::{copy_matches_to_output, PersonSearch};
use facefind_core::{
    Config, FaceRepository, MatchSettings, MatchingEngine, OnnxExtractor, OverwritePolicy,
    RegistrationPipeline, SearchOutcome,
};
use facefind_store::SqliteRepository;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

mod render;
mod viewer;

#[derive(Parser)]
#[command(name = "facefind", version, about = "Find every event photo showing a person")]
struct Cli {
    /// Configuration file (default: ./facefind.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index every single-face photo under a directory
    #[command(alias = "build")]
    Register {
        /// Photo directory (default: storage.event_photos)
        #[arg(long)]
        photos: Option<PathBuf>,
        /// What to do with a known path whose content changed: reject | replace
        #[arg(long)]
        overwrite: Option<OverwritePolicy>,
        #[arg(long)]
        json: bool,
    },
    /// Search with one photo, or with a folder of reference photos of one person
    Search {
        path: PathBuf,
        /// Maximum number of matches
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Show every candidate and the threshold verdict
        #[arg(long)]
        debug: bool,
        /// Open matched photos in the default image viewer
        #[arg(short, long)]
        open: bool,
        /// Copy folder-search matches to person_search.output_root
        #[arg(long)]
        copy: bool,
        #[arg(long)]
        json: bool,
    },
    /// Remove every record from the index
    Clear {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Show index size and model identity
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Remove one photo from the index
    Remove { path: PathBuf },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().or_else(|| {
        let local = PathBuf::from("facefind.toml");
        local.is_file().then_some(local)
    });
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;
    tracing::debug!(config = ?config_path, "configuration loaded");

    match cli.command {
        Commands::Register {
            photos,
            overwrite,
            json,
        } => register(&config, open_store(&config)?, photos, overwrite, json),
        Commands::Search {
            path,
            limit,
            debug,
            open,
            copy,
            json,
        } => {
            let flags = SearchFlags {
                debug,
                open,
                copy,
                json,
            };
            search(&config, open_store(&config)?, &path, limit, flags)
        }
        Commands::Clear { yes } => clear(open_store(&config)?.as_ref(), yes),
        Commands::Stats { json } => stats(&config, open_store(&config)?.as_ref(), json),
        Commands::Remove { path } => remove(open_store(&config)?.as_ref(), &path),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn FaceRepository>> {
    let store = SqliteRepository::open(&config.storage.db_path)
        .with_context(|| format!("opening {}", config.storage.db_path.display()))?;
    Ok(Arc::new(store))
}

fn load_extractor(config: &Config) -> Result<OnnxExtractor> {
    OnnxExtractor::from_config(&config.model).with_context(|| {
        format!(
            "loading face models from {}",
            config.model.model_dir.display()
        )
    })
}

fn register(
    config: &Config,
    repository: Arc<dyn FaceRepository>,
    photos: Option<PathBuf>,
    overwrite: Option<OverwritePolicy>,
    json: bool,
) -> Result<ExitCode> {
    let directory = photos.unwrap_or_else(|| config.storage.event_photos.clone());
    if !guard::validate_path(&directory, &config.storage.allowed_directories) {
        bail!(
            "{} is not inside an allowed directory (storage.allowed_directories)",
            directory.display()
        );
    }

    let mut extractor = load_extractor(config)?;
    let pipeline = RegistrationPipeline::new(
        repository,
        config.storage.image_extensions.clone(),
        config.matching.distance_metric,
    );
    let policy = overwrite.unwrap_or(config.storage.overwrite);
    let report = pipeline.register(&mut extractor, &directory, policy)?;

    let mut out = std::io::stdout().lock();
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    } else {
        render::registration(&mut out, &report)?;
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Debug, Clone, Copy)]
struct SearchFlags {
    debug: bool,
    open: bool,
    copy: bool,
    json: bool,
}

fn search(
    config: &Config,
    repository: Arc<dyn FaceRepository>,
    path: &Path,
    limit: Option<usize>,
    flags: SearchFlags,
) -> Result<ExitCode> {
    let SearchFlags {
        debug,
        open,
        copy,
        json,
    } = flags;
    let max_limit = config.matching.max_limit;
    let limit = limit.unwrap_or(config.matching.default_limit);
    if limit == 0 || limit > max_limit {
        bail!("limit must be between 1 and {max_limit}");
    }

    let engine = MatchingEngine::new(repository, MatchSettings::from(&config.matching));
    let mut extractor = load_extractor(config)?;
    let mut out = std::io::stdout().lock();

    if path.is_dir() {
        let result = PersonSearch::from_config(config)
            .search_folder(&engine, &mut extractor, path, limit)?;
        let summary = if copy {
            Some(copy_matches_to_output(&result, &config.person_search.output_root)?)
        } else {
            None
        };
        if json {
            let value = serde_json::json!({ "result": result, "output": summary });
            writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
        } else {
            render::person_search(&mut out, &result, summary.as_ref())?;
        }
        if open {
            viewer::open_matches(&result.matches);
        }
        return Ok(if result.matches.is_empty() {
            ExitCode::from(1)
        } else {
            ExitCode::SUCCESS
        });
    }
    if copy {
        bail!("--copy only applies to a folder of reference photos");
    }

    let image = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let files = &config.files;
    match guard::validate_upload(&image, "", files.max_upload_bytes(), &files.allowed_formats) {
        UploadOutcome::Accepted(_) => {}
        UploadOutcome::TooLarge { size, max } => {
            bail!("{} is {size} bytes, the limit is {max}", path.display())
        }
        UploadOutcome::UnsupportedType { .. } => {
            bail!("{} is not an accepted image format", path.display())
        }
    }

    if debug {
        let trace = engine.trace(&mut extractor, &image, limit)?;
        if json {
            writeln!(out, "{}", serde_json::to_string_pretty(&trace)?)?;
        } else {
            render::trace(&mut out, &trace)?;
        }
        return Ok(ExitCode::SUCCESS);
    }

    match engine.search(&mut extractor, &image, limit)? {
        SearchOutcome::Matches(matches) => {
            if json {
                let value = serde_json::json!({ "success": true, "matches": matches });
                writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
            } else {
                render::matches(&mut out, &matches)?;
            }
            if open {
                viewer::open_matches(&matches);
            }
            Ok(if matches.is_empty() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            })
        }
        SearchOutcome::Rejected(failure) => {
            if json {
                let value = serde_json::json!({
                    "success": false,
                    "error": { "code": failure.code(), "message": failure.to_string() },
                });
                writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
            } else {
                eprintln!("{failure}");
            }
            Ok(ExitCode::from(2))
        }
    }
}

fn clear(repository: &dyn FaceRepository, yes: bool) -> Result<ExitCode> {
    let count = repository.count()?;
    if count == 0 {
        println!("Index is already empty");
        return Ok(ExitCode::SUCCESS);
    }
    if !yes {
        print!("Delete all {count} indexed faces? [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted");
            return Ok(ExitCode::from(1));
        }
    }
    let removed = repository.clear()?;
    println!("Removed {removed} faces");
    Ok(ExitCode::SUCCESS)
}

fn stats(config: &Config, repository: &dyn FaceRepository, json: bool) -> Result<ExitCode> {
    let faces = repository.count()?;
    let provenance = repository.provenance()?;
    let mut out = std::io::stdout().lock();
    if json {
        let value = serde_json::json!({
            "faces": faces,
            "db_path": config.storage.db_path,
            "provenance": provenance,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
    } else {
        render::stats(&mut out, &config.storage.db_path, faces, provenance.as_ref())?;
    }
    Ok(ExitCode::SUCCESS)
}

fn remove(repository: &dyn FaceRepository, path: &Path) -> Result<ExitCode> {
    // Records are keyed by canonical path; fall back to the literal path
    // for files that no longer exist.
    let key = std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned();
    if repository.delete(&key)? {
        println!("Removed {key}");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Not indexed: {key}");
        Ok(ExitCode::from(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_is_an_alias_of_register() {
        let cli = Cli::try_parse_from(["facefind", "build", "--overwrite", "replace"]).unwrap();
        match cli.command {
            Commands::Register { overwrite, photos, json } => {
                assert_eq!(overwrite, Some(OverwritePolicy::Replace));
                assert!(photos.is_none());
                assert!(!json);
            }
            _ => panic!("expected register"),
        }
    }

    #[test]
    fn test_search_flags() {
        let cli = Cli::try_parse_from([
            "facefind", "--config", "/etc/facefind.toml", "search", "me.jpg", "-n", "5", "--debug",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/facefind.toml")));
        match cli.command {
            Commands::Search { path, limit, debug, open, copy, .. } => {
                assert_eq!(path, PathBuf::from("me.jpg"));
                assert_eq!(limit, Some(5));
                assert!(debug);
                assert!(!open);
                assert!(!copy);
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn test_open_flag_listed_in_search_help() {
        let cli =
            Cli::try_parse_from(["facefind", "search", "people/Ana_Lima", "-o", "--copy"]).unwrap();
        assert!(matches!(cli.command, Commands::Search { open: true, copy: true, .. }));

        let mut cmd = Cli::command();
        let help = cmd
            .find_subcommand_mut("search")
            .unwrap()
            .render_long_help()
            .to_string();
        assert!(help.contains("--open"));
        assert!(help.contains("--limit"));
        assert!(help.to_lowercase().contains("folder"));
    }

    #[test]
    fn test_bad_overwrite_policy_rejected() {
        assert!(Cli::try_parse_from(["facefind", "register", "--overwrite", "maybe"]).is_err());
    }

    #[test]
    fn test_remove_missing_record() {
        let repo = facefind_core::MemoryRepository::new();
        let code = remove(&repo, Path::new("/no/such/photo.jpg")).unwrap();
        assert_eq!(code, ExitCode::from(1));
    }
}
