//! semfs: operator tool for a persisted semantic file system.
//!
//! # Usage
//!
//! ```bash
//! # Create semfs.json pointing at a store directory
//! semfs init --dir .semfs
//!
//! # Add a project and a folder served over REST
//! semfs add-root proj
//! semfs mkdir /proj/web --provider rest
//! semfs link /proj/web/index.html https://example.com/index.html
//!
//! # Pull remote content and read it
//! semfs sync /proj/web --direction incoming
//! semfs cat /proj/web/index.html
//! ```

mod settings;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use semfs_core::{
    props, CancellationToken, ContentProvider, DefaultContentProvider, FederatingProvider,
    MultiStatus, ProviderRegistry, QualifiedName, SemanticFileSystem, SemanticStore, Severity,
    SyncDirection,
};
use semfs_rest::{HttpTransport, RestContentProvider, RestTransport};
use settings::Settings;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "semfs")]
#[command(author = "SemFS Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Semantic file system tool")]
struct Cli {
    /// Settings file
    #[arg(short, long, global = true, default_value = "semfs.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a settings file for a persistent store directory
    Init {
        /// Store directory (tree document, cache, spool files)
        #[arg(short, long, default_value = ".semfs")]
        dir: PathBuf,
        /// Overwrite an existing settings file
        #[arg(long)]
        force: bool,
    },

    /// List roots
    Roots,

    /// Add a root (project)
    #[command(name = "add-root")]
    AddRoot {
        name: String,
        /// Root URI recorded on the project
        #[arg(long)]
        uri: Option<String>,
        /// Provider id bound to the whole project
        #[arg(long)]
        provider: Option<String>,
    },

    /// List the children of a folder
    Ls {
        path: String,
        /// Show kind, provider and remote URI
        #[arg(short, long)]
        long: bool,
    },

    /// Create a folder
    Mkdir {
        path: String,
        /// Fail if the parent does not exist
        #[arg(long)]
        shallow: bool,
        /// Provider id bound to the new folder
        #[arg(long)]
        provider: Option<String>,
    },

    /// Write a file from a local file or stdin
    Put {
        path: String,
        /// Local source file (default: stdin)
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(long)]
        append: bool,
    },

    /// Print a file
    Cat { path: String },

    /// Remove a resource
    Rm {
        path: String,
        /// Also delete the remote counterpart
        #[arg(long)]
        remote: bool,
    },

    /// List, read, set or delete persistent properties
    Prop {
        path: String,
        /// Property key (`qualifier:name`, bare names use `semfs`)
        key: Option<String>,
        value: Option<String>,
        #[arg(long, conflicts_with = "value")]
        delete: bool,
    },

    /// Add a file or folder addressed by URI
    Link {
        path: String,
        uri: String,
        #[arg(long)]
        folder: bool,
    },

    /// Find the paths holding a remote URI
    Locate {
        uri: String,
        /// Only report paths below this one
        #[arg(long)]
        under: Option<String>,
    },

    /// Synchronize with the remote side
    Sync {
        path: String,
        /// incoming, outgoing or both
        #[arg(short, long, default_value = "both")]
        direction: SyncDirection,
    },

    /// Show resource metadata
    Info { path: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { "semfs=debug" } else { "semfs=info" };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    match cli.command {
        Commands::Init { dir, force } => cmd_init(&cli.config, &dir, force),
        command => {
            let settings = Settings::load(&cli.config)?;
            let fs = open(&settings)?;
            let result = run(&fs, command);
            fs.flush().context("Failed to save the tree")?;
            result
        }
    }
}

fn run(fs: &SemanticFileSystem, command: Commands) -> Result<()> {
    match command {
        Commands::Init { .. } => bail!("init runs without an open file system"),
        Commands::Roots => cmd_roots(fs),
        Commands::AddRoot { name, uri, provider } => cmd_add_root(fs, &name, uri.as_deref(), provider.as_deref()),
        Commands::Ls { path, long } => cmd_ls(fs, &path, long),
        Commands::Mkdir {
            path,
            shallow,
            provider,
        } => cmd_mkdir(fs, &path, shallow, provider.as_deref()),
        Commands::Put { path, file, append } => cmd_put(fs, &path, file.as_deref(), append),
        Commands::Cat { path } => cmd_cat(fs, &path),
        Commands::Rm { path, remote } => cmd_rm(fs, &path, remote),
        Commands::Prop {
            path,
            key,
            value,
            delete,
        } => cmd_prop(fs, &path, key.as_deref(), value.as_deref(), delete),
        Commands::Link { path, uri, folder } => cmd_link(fs, &path, &uri, folder),
        Commands::Locate { uri, under } => cmd_locate(fs, &uri, under.as_deref()),
        Commands::Sync { path, direction } => cmd_sync(fs, &path, direction),
        Commands::Info { path } => cmd_info(fs, &path),
    }
}

/// Registry with the providers this tool ships
fn registry(settings: &Settings) -> Result<ProviderRegistry> {
    let transport: Arc<dyn RestTransport> = Arc::new(match settings.rest_timeout_secs {
        Some(secs) => HttpTransport::with_timeout(Duration::from_secs(secs)),
        None => HttpTransport::new(),
    }?);
    let routes = settings.federation.clone();

    Ok(ProviderRegistry::new()
        .with(DefaultContentProvider::ID, |id| Ok(DefaultContentProvider::shared(id)))
        .with(FederatingProvider::ID, move |id| {
            Ok(Arc::new(FederatingProvider::new(id, routes.clone())) as Arc<dyn ContentProvider>)
        })
        .with(RestContentProvider::ID, RestContentProvider::factory(transport)))
}

fn open(settings: &Settings) -> Result<SemanticFileSystem> {
    tracing::debug!(tree = ?settings.file_system.tree_path, "opening file system");
    let registry = registry(settings).context("Failed to set up providers")?;
    SemanticFileSystem::open(settings.file_system.clone(), Arc::new(registry))
        .context("Failed to open the file system")
}

/// Parent path and last segment of `path`
fn split(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) if !parent.is_empty() && !name.is_empty() => Ok((parent, name)),
        _ => bail!("{} does not name a resource below a root", path),
    }
}

fn existing(fs: &SemanticFileSystem, path: &str) -> Result<SemanticStore> {
    let store = fs
        .find_store(path)?
        .filter(|s| s.exists().unwrap_or(false))
        .ok_or_else(|| anyhow!("No such resource: {}", path))?;
    Ok(store)
}

fn property_key(key: &str) -> Result<QualifiedName> {
    if key.contains(':') {
        Ok(QualifiedName::parse(key)?)
    } else {
        Ok(props::key(key))
    }
}

fn cmd_init(config: &Path, dir: &Path, force: bool) -> Result<()> {
    if config.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", config.display());
    }
    Settings::for_dir(dir).save(config)?;
    println!("Initialized {}", config.display());
    println!("  Store: {}", dir.display());
    Ok(())
}

fn cmd_roots(fs: &SemanticFileSystem) -> Result<()> {
    for name in fs.root_names()? {
        if fs.root(&name).is_ok() {
            println!("{}", name);
        }
    }
    Ok(())
}

fn cmd_add_root(fs: &SemanticFileSystem, name: &str, uri: Option<&str>, provider: Option<&str>) -> Result<()> {
    let root = fs.add_root(name, uri)?;
    if let Some(provider) = provider {
        root.set_content_provider_id(Some(provider))?;
    }
    println!("Added root {}", root.path()?);
    Ok(())
}

fn cmd_ls(fs: &SemanticFileSystem, path: &str, long: bool) -> Result<()> {
    let folder = existing(fs, path)?;
    for child in folder.child_stores()? {
        let name = child.name()?;
        if !long {
            println!("{}", name);
            continue;
        }
        let provider = child.content_provider_id()?.unwrap_or_else(|| "-".to_string());
        let uri = child
            .persistent_property(&props::key(props::REMOTE_URI))?
            .unwrap_or_default();
        println!("{:<8} {:<12} {:<24} {}", child.kind()?, provider, name, uri);
    }
    Ok(())
}

fn cmd_mkdir(fs: &SemanticFileSystem, path: &str, shallow: bool, provider: Option<&str>) -> Result<()> {
    let folder = fs.get_store(path)?.mkdir(shallow)?;
    if let Some(provider) = provider {
        folder.set_content_provider_id(Some(provider))?;
    }
    println!("Created {}", folder.path()?);
    Ok(())
}

fn cmd_put(fs: &SemanticFileSystem, path: &str, file: Option<&Path>, append: bool) -> Result<()> {
    let content = match file {
        Some(file) => std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?,
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };
    let store = fs.get_store(path)?;
    if let Some(parent) = store.parent()? {
        parent.mkdir(false)?;
    }

    let token = CancellationToken::new();
    let mut out = store.open_output_stream(append, &token)?;
    out.write_all(&content)?;
    out.flush()?;
    println!("Wrote {} bytes to {}", content.len(), store.path()?);
    Ok(())
}

fn cmd_cat(fs: &SemanticFileSystem, path: &str) -> Result<()> {
    let store = existing(fs, path)?;
    let mut input = store.open_input_stream(&CancellationToken::new())?;
    let mut stdout = io::stdout().lock();
    io::copy(&mut input, &mut stdout)?;
    stdout.flush()?;
    Ok(())
}

fn cmd_rm(fs: &SemanticFileSystem, path: &str, remote: bool) -> Result<()> {
    let store = existing(fs, path)?;
    let token = CancellationToken::new();
    let status = store.validate_remove(&token);
    if !status.is_acceptable() {
        bail!("Cannot remove {}: {}", path, status);
    }
    store.remove(!remote, &token)?;
    println!("Removed {}", path);
    Ok(())
}

fn cmd_prop(
    fs: &SemanticFileSystem,
    path: &str,
    key: Option<&str>,
    value: Option<&str>,
    delete: bool,
) -> Result<()> {
    let store = existing(fs, path)?;
    let Some(key) = key else {
        for (key, value) in store.persistent_properties()? {
            println!("{} = {}", key, value);
        }
        return Ok(());
    };
    let key = property_key(key)?;
    match (value, delete) {
        (_, true) => {
            store.remove_persistent_property(&key)?;
            println!("Deleted {}", key);
        }
        (Some(value), false) => {
            store.set_persistent_property(&key, Some(value))?;
            println!("{} = {}", key, value);
        }
        (None, false) => match store.persistent_property(&key)? {
            Some(value) => println!("{}", value),
            None => bail!("{} has no property {}", path, key),
        },
    }
    Ok(())
}

fn cmd_link(fs: &SemanticFileSystem, path: &str, uri: &str, folder: bool) -> Result<()> {
    let (parent, name) = split(path)?;
    let parent = fs.get_store(parent)?;
    let token = CancellationToken::new();
    let linked = if folder {
        parent.add_folder_from_remote_by_uri(name, uri, &token)?
    } else {
        parent.add_file_from_remote_by_uri(name, uri, &token)?
    };
    println!("Linked {} -> {}", linked.path()?, uri);
    Ok(())
}

fn cmd_locate(fs: &SemanticFileSystem, uri: &str, under: Option<&str>) -> Result<()> {
    let paths = fs.locate(uri, under)?;
    if paths.is_empty() {
        bail!("No resource holds {}", uri);
    }
    for path in paths {
        println!("{}", path);
    }
    Ok(())
}

fn cmd_sync(fs: &SemanticFileSystem, path: &str, direction: SyncDirection) -> Result<()> {
    let store = existing(fs, path)?;
    let mut status = MultiStatus::new();
    store.synchronize_content_with_remote(direction, &mut status, &CancellationToken::new());

    for entry in status.entries() {
        println!("{}", entry);
    }
    match status.severity() {
        Severity::Error | Severity::Cancel => {
            let failed = status.errors().count();
            Err(anyhow!("Synchronization of {} finished with {} problem(s)", path, failed))
        }
        _ => {
            println!("Synchronized {} ({})", path, direction);
            Ok(())
        }
    }
}

fn cmd_info(fs: &SemanticFileSystem, path: &str) -> Result<()> {
    let store = fs.get_store(path)?;
    let token = CancellationToken::new();
    let info = store.fetch_info(&token)?;

    println!("Path:          {}", store.path()?);
    println!("Kind:          {}", store.kind()?);
    println!("Exists:        {}", info.exists);
    println!("Directory:     {}", info.is_directory);
    println!("Read-only:     {}", info.read_only);
    match info.last_modified {
        Some(ts) => println!("Last modified: {}", ts),
        None => println!("Last modified: -"),
    }
    if info.exists {
        let provider = store.effective_content_provider()?;
        println!("Provider:      {}", provider.id());
        if let Some(uri) = store.remote_uri()? {
            println!("Remote URI:    {}", uri);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split() {
        assert_eq!(split("/proj/a/b.txt").unwrap(), ("/proj/a", "b.txt"));
        assert_eq!(split("/proj/dir/").unwrap(), ("/proj", "dir"));
        assert!(split("/proj").is_err());
        assert!(split("name").is_err());
    }

    #[test]
    fn test_property_key() {
        assert_eq!(property_key("remote-uri").unwrap().to_string(), props::REMOTE_URI);
        assert_eq!(property_key("app:color").unwrap().to_string(), "app:color");
        assert!(property_key(":x").is_err());
    }

    #[test]
    fn test_cli_parses_sync_direction() {
        let cli = Cli::try_parse_from(["semfs", "sync", "/proj", "-d", "in"]).unwrap();
        match cli.command {
            Commands::Sync { direction, .. } => assert_eq!(direction, SyncDirection::Incoming),
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["semfs", "sync", "/proj", "-d", "sideways"]).is_err());
    }

    #[test]
    fn test_commands_against_memory_tree() {
        let settings = Settings::default();
        let fs = open(&settings).unwrap();
        cmd_add_root(&fs, "proj", None, None).unwrap();
        cmd_mkdir(&fs, "/proj/docs", false, None).unwrap();
        cmd_prop(&fs, "/proj/docs", Some("app:color"), Some("red"), false).unwrap();

        let docs = existing(&fs, "/proj/docs").unwrap();
        let key = QualifiedName::parse("app:color").unwrap();
        assert_eq!(docs.persistent_property(&key).unwrap().as_deref(), Some("red"));
        assert!(existing(&fs, "/proj/missing").is_err());
        assert!(cmd_locate(&fs, "http://nowhere", None).is_err());
    }
}
