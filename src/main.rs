//! biodv CLI - Command-line interface for biodv taxonomy databases.

use biodv::catalog::{CatalogFormat, CatalogOptions, render_catalog};
use biodv::dataset::DatasetDb;
use biodv::lint::{Fixable, LintSeverity, fix_issues, lint_taxonomy};
use biodv::query::Registry;
use biodv::storage::{self, datasets_path, find_root, load_config, taxonomy_path};
use biodv::sync::{Reconciler, SyncReport};
use biodv::taxonomy::{Db, Taxon};
use biodv::types::{AUTHOR, Rank, status_label};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "biodv")]
#[command(about = "A local taxonomy database kept in sync with remote taxonomic services")]
#[command(version)]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a biodv project in the current directory
    Init {
        /// Reset the configuration of an existing project
        #[arg(short, long)]
        force: bool,
    },

    /// Edit and inspect the local taxonomy
    Tax {
        #[command(subcommand)]
        tax_command: TaxCommands,
    },

    /// Import and reconcile taxa with a remote taxonomy
    Db {
        #[command(subcommand)]
        db_command: DbCommands,
    },
}

#[derive(Subcommand)]
enum TaxCommands {
    /// Add a taxon
    Add {
        /// Taxon name
        name: String,

        /// Parent taxon (root when omitted)
        #[arg(short, long, default_value = "")]
        parent: String,

        /// Rank (unranked, kingdom, phylum, class, order, family, genus, species)
        #[arg(short, long, default_value = "unranked")]
        rank: String,

        /// Add as a synonym of the parent
        #[arg(long)]
        synonym: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List the children of a taxon (root taxa when omitted)
    List {
        /// Parent taxon
        parent: Option<String>,

        /// Include synonyms
        #[arg(short, long)]
        synonyms: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show a taxon by name or id
    Info {
        /// Taxon name or id
        taxon: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Set a field of a taxon (an empty value removes it)
    Set {
        /// Taxon name
        name: String,

        /// Field key (author, reference, source, extern, comment, ...)
        key: String,

        /// Field value
        #[arg(default_value = "")]
        value: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Move a taxon to a new parent. Its descendants become children of the new parent.
    Move {
        /// Taxon name
        name: String,

        /// New parent (root when omitted)
        #[arg(short, long, default_value = "")]
        parent: String,

        /// Make it a synonym of the new parent
        #[arg(long)]
        synonym: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Change the rank of a taxon
    Rank {
        /// Taxon name
        name: String,

        /// New rank
        rank: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Delete a taxon, re-attaching its children to its parent
    Delete {
        /// Taxon name
        name: String,

        /// Delete the whole subtree
        #[arg(short, long)]
        recursive: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print a taxonomic catalog
    Catalog {
        /// Start at this taxon
        #[arg(long)]
        root: Option<String>,

        /// Catalog format (text, html)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Document title (html)
        #[arg(short, long, default_value = "")]
        title: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check the taxonomy file for problems
    Lint {
        /// Auto-fix fixable issues
        #[arg(long)]
        fix: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

/// Remote taxonomy selection shared by the db commands.
#[derive(Args)]
struct RemoteArgs {
    /// Service name (gbif, biodv)
    service: String,

    /// Driver parameter (the project directory for biodv)
    #[arg(long, default_value = "")]
    param: String,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,
}

#[derive(Subcommand)]
enum DbCommands {
    /// Import taxa by name
    Add {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Taxon names
        #[arg(required = true)]
        names: Vec<String>,

        /// Also import missing ancestors below this rank
        #[arg(short, long)]
        rank: Option<String>,
    },

    /// Import synonyms, and children of species, of linked taxa
    Fill {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Start taxa (the whole tree when omitted)
        names: Vec<String>,
    },

    /// Move root taxa under their remote ancestors up to a rank
    Uprank {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Target rank
        #[arg(short, long)]
        rank: String,

        /// Start taxa (all root taxa when omitted)
        names: Vec<String>,
    },

    /// Link taxa by name and refresh their fields
    Update {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Only link, do not refresh fields
        #[arg(long = "match")]
        match_only: bool,
    },

    /// Reconcile parents, status and ranks of linked taxa
    Sync {
        #[command(flatten)]
        remote: RemoteArgs,
    },
}

fn get_project_root(format: &str) -> PathBuf {
    let cwd = current_dir(format);
    match find_root(&cwd) {
        Some(root) => root,
        None => emit_error(format, "not_in_project", "Not in a biodv project"),
    }
}

fn current_dir(format: &str) -> PathBuf {
    env::current_dir()
        .unwrap_or_else(|e| emit_error(format, "io_error", &format!("Current directory: {}", e)))
}

fn open_db(root: &Path, format: &str) -> Db {
    Db::open(&taxonomy_path(root)).unwrap_or_else(|e| emit_error(format, "open_failed", &e.to_string()))
}

fn commit_db(db: &mut Db, format: &str) {
    if let Err(e) = db.commit() {
        emit_error(format, "commit_failed", &e.to_string());
    }
}

fn parse_rank(format: &str, s: &str) -> Rank {
    s.parse()
        .unwrap_or_else(|e: String| emit_error(format, "invalid_rank", &e))
}

fn is_json(format: &str) -> bool {
    format == "json"
}

fn emit_error(format: &str, code: &str, detail: &str) -> ! {
    if is_json(format) {
        eprintln!("{}", json!({"error": code, "detail": detail}));
    } else {
        eprintln!("{}", format!("Error: {}", detail).red());
    }
    process::exit(1);
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => emit_error("json", "json_error", &e.to_string()),
    }
}

fn emit_done(format: &str, action: &str, name: &str) {
    if is_json(format) {
        print_json(&json!({"success": true, "action": action, "taxon": name}));
    } else {
        println!("{}", format!("{}: {}", action, name).green());
    }
}

fn taxon_line(taxon: &Taxon) -> String {
    let mut line = if taxon.is_correct() {
        taxon.name().bold().to_string()
    } else {
        taxon.name().italic().dimmed().to_string()
    };
    let author = taxon.value(AUTHOR);
    if !author.is_empty() {
        line.push(' ');
        line.push_str(author);
    }
    format!("{:<12} {}", taxon.rank().as_str(), line)
}

fn print_taxon(db: &Db, taxon: &Taxon, format: &str) {
    let parents: Vec<&str> = db.parents(taxon.name()).iter().map(|t| t.name()).collect();
    let synonyms: Vec<&str> = db.synonyms(taxon.name()).iter().map(|t| t.name()).collect();
    let children: Vec<&str> = db.children(taxon.name()).iter().map(|t| t.name()).collect();

    if is_json(format) {
        print_json(&json!({
            "taxon": taxon.to_record(),
            "parents": parents,
            "synonyms": synonyms,
            "children": children,
        }));
        return;
    }

    println!("{}", taxon.name().bold());
    println!("  Rank:     {}", taxon.rank());
    println!("  Status:   {}", status_label(taxon.is_correct()));
    if !parents.is_empty() {
        println!("  Parents:  {}", parents.join(" < "));
    }
    for (key, value) in taxon.fields() {
        let mut lines = value.lines();
        println!("  {:<9} {}", format!("{}:", key), lines.next().unwrap_or(""));
        for more in lines {
            println!("            {}", more);
        }
    }
    if !synonyms.is_empty() {
        println!("  Synonyms: {}", synonyms.join(", "));
    }
    if !children.is_empty() {
        println!("  Children: {}", children.len());
    }
}

fn print_report(report: &SyncReport, format: &str) {
    if is_json(format) {
        print_json(&json!(report));
        return;
    }

    for (label, names) in [
        ("Added", &report.added),
        ("Moved", &report.moved),
        ("Re-ranked", &report.reranked),
        ("Updated", &report.updated),
    ] {
        for name in names {
            println!("{}", format!("{}: {}", label, name).green());
        }
    }
    for warning in &report.warnings {
        eprintln!("{}", format!("Warning: {}", warning).yellow());
    }
    for error in &report.errors {
        eprintln!("{}", format!("Error: {}", error).red());
    }
    if report.changes() == 0 && report.is_ok() {
        println!("{}", "Nothing to do".dimmed());
    }
}

/// Open the project and the remote service, run `op` and commit the result.
fn run_reconciler<F>(remote: &RemoteArgs, op: F)
where
    F: FnOnce(&mut Reconciler<'_>),
{
    let format = remote.format.as_str();
    let root = get_project_root(format);
    let config = load_config(&root);
    let registry = Registry::with_defaults(&config.gbif);

    let taxonomy = registry
        .open_taxonomy(&remote.service, &remote.param)
        .unwrap_or_else(|e| emit_error(format, "open_failed", &e.to_string()));
    let dataset_source = registry
        .open_datasets(&remote.service, &remote.param)
        .unwrap_or_else(|e| emit_error(format, "open_failed", &e.to_string()));

    let mut db = open_db(&root, format);
    let mut datasets = DatasetDb::open(&datasets_path(&root))
        .unwrap_or_else(|e| emit_error(format, "open_failed", &e.to_string()));

    let report = {
        let mut reconciler = Reconciler::new(&mut db, &*taxonomy, &remote.service)
            .with_datasets(&mut datasets, dataset_source.as_deref());
        op(&mut reconciler);
        reconciler.finish()
    };

    commit_db(&mut db, format);
    if let Err(e) = datasets.commit() {
        emit_error(format, "commit_failed", &e.to_string());
    }

    print_report(&report, format);
    if !report.is_ok() {
        process::exit(1);
    }
}

fn init_logging() {
    let log_level = env::var("BIODV_LOG").unwrap_or_else(|_| "warn".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            let cwd = current_dir("text");

            match storage::init(&cwd, force) {
                Ok(created) => {
                    for path in &created {
                        let display = path.strip_prefix(&cwd).unwrap_or(path);
                        println!("{}", format!("Created {}", display.display()).green());
                    }

                    println!();
                    println!("{}", "biodv project initialized.".green().bold());
                    println!();
                    println!("Next steps:");
                    println!("  biodv tax add <name> --rank <rank>   # Add a taxon by hand");
                    println!("  biodv db add gbif <name>             # Import a taxon from GBIF");
                }
                Err(e) => {
                    eprintln!("{}", format!("Error: {}", e).red());
                    process::exit(1);
                }
            }
        }

        Commands::Tax { tax_command } => match tax_command {
            TaxCommands::Add {
                name,
                parent,
                rank,
                synonym,
                format,
            } => {
                let rank = parse_rank(&format, &rank);
                let root = get_project_root(&format);
                let mut db = open_db(&root, &format);
                let added = match db.add(&name, &parent, rank, !synonym) {
                    Ok(taxon) => taxon.name().to_string(),
                    Err(e) => emit_error(&format, "add_failed", &e.to_string()),
                };
                commit_db(&mut db, &format);
                emit_done(&format, "Added", &added);
            }

            TaxCommands::List {
                parent,
                synonyms,
                format,
            } => {
                let root = get_project_root(&format);
                let db = open_db(&root, &format);
                let parent = parent.unwrap_or_default();
                if !parent.trim().is_empty() && db.taxon(&parent).is_none() {
                    emit_error(&format, "not_found", &format!("Taxon not found: {}", parent));
                }

                let mut taxa = db.children(&parent);
                if synonyms && !parent.trim().is_empty() {
                    taxa.extend(db.synonyms(&parent));
                }

                if is_json(&format) {
                    let records: Vec<_> = taxa.iter().map(|t| t.to_record()).collect();
                    print_json(&json!(records));
                } else if taxa.is_empty() {
                    println!("{}", "No taxa found".dimmed());
                } else {
                    for taxon in taxa {
                        println!("{}", taxon_line(taxon));
                    }
                }
            }

            TaxCommands::Info { taxon, format } => {
                let root = get_project_root(&format);
                let db = open_db(&root, &format);
                let found = match db.taxon(&taxon) {
                    Some(t) => Some(t),
                    None => db.taxon_by_id(&taxon).unwrap_or(None),
                };
                match found {
                    Some(t) => print_taxon(&db, t, &format),
                    None => emit_error(&format, "not_found", &format!("Taxon not found: {}", taxon)),
                }
            }

            TaxCommands::Set {
                name,
                key,
                value,
                format,
            } => {
                let root = get_project_root(&format);
                let mut db = open_db(&root, &format);
                if let Err(e) = db.set_value(&name, &key, &value) {
                    emit_error(&format, "set_failed", &e.to_string());
                }
                commit_db(&mut db, &format);
                emit_done(&format, "Updated", &name);
            }

            TaxCommands::Move {
                name,
                parent,
                synonym,
                format,
            } => {
                let root = get_project_root(&format);
                let mut db = open_db(&root, &format);
                if let Err(e) = db.move_taxon(&name, &parent, !synonym) {
                    emit_error(&format, "move_failed", &e.to_string());
                }
                commit_db(&mut db, &format);
                emit_done(&format, "Moved", &name);
            }

            TaxCommands::Rank { name, rank, format } => {
                let rank = parse_rank(&format, &rank);
                let root = get_project_root(&format);
                let mut db = open_db(&root, &format);
                if let Err(e) = db.set_rank(&name, rank) {
                    emit_error(&format, "rank_failed", &e.to_string());
                }
                commit_db(&mut db, &format);
                emit_done(&format, "Re-ranked", &name);
            }

            TaxCommands::Delete {
                name,
                recursive,
                format,
            } => {
                let root = get_project_root(&format);
                let mut db = open_db(&root, &format);
                if let Err(e) = db.delete(&name, recursive) {
                    emit_error(&format, "delete_failed", &e.to_string());
                }
                commit_db(&mut db, &format);
                emit_done(&format, "Deleted", &name);
            }

            TaxCommands::Catalog {
                root: start,
                format,
                title,
                output,
            } => {
                let catalog_format: CatalogFormat = format
                    .parse()
                    .unwrap_or_else(|e: String| emit_error("text", "invalid_format", &e));
                let root = get_project_root("text");
                let db = open_db(&root, "text");
                let options = CatalogOptions {
                    root: start,
                    format: catalog_format,
                    title,
                };
                let text = render_catalog(&db, &options)
                    .unwrap_or_else(|e| emit_error("text", "catalog_failed", &e.to_string()));

                match output {
                    Some(path) => {
                        if let Err(e) = fs::write(&path, &text) {
                            emit_error("text", "io_error", &e.to_string());
                        }
                        println!("{}", format!("Catalog written to {}", path.display()).green());
                    }
                    None => print!("{}", text),
                }
            }

            TaxCommands::Lint { fix, format } => {
                let root = get_project_root(&format);
                let path = taxonomy_path(&root);
                let report = lint_taxonomy(&path);

                let mut fixed = Vec::new();
                if fix && !report.fixable().is_empty() {
                    fixed = fix_issues(&path, &report);
                }

                if is_json(&format) {
                    let issues: Vec<_> = report
                        .issues
                        .iter()
                        .map(|i| {
                            json!({
                                "file": i.file.display().to_string(),
                                "record": i.record,
                                "taxon": i.taxon,
                                "severity": i.severity.to_string(),
                                "message": i.message,
                                "fixable": i.fixable == Fixable::Yes,
                            })
                        })
                        .collect();
                    print_json(&json!({
                        "errors": report.errors().len(),
                        "warnings": report.warnings().len(),
                        "fixable": report.fixable().len(),
                        "issues": issues,
                        "fixed": fixed,
                    }));
                    if report.has_errors() {
                        process::exit(1);
                    }
                    return;
                }

                if report.issues.is_empty() {
                    println!("{}", "No issues found".green());
                    return;
                }

                for issue in &report.issues {
                    let message = issue.to_string();
                    match issue.severity {
                        LintSeverity::Error => println!("{}", message.red()),
                        LintSeverity::Warning => println!("{}", message.yellow()),
                    }
                }
                println!();
                println!(
                    "{} error(s), {} warning(s)",
                    report.errors().len(),
                    report.warnings().len()
                );

                for msg in &fixed {
                    println!("{}", format!("Fixed: {}", msg).green());
                }
                if !fix && !report.fixable().is_empty() {
                    println!(
                        "{}",
                        format!(
                            "{} issue(s) can be fixed with --fix",
                            report.fixable().len()
                        )
                        .dimmed()
                    );
                }

                if report.has_errors() {
                    process::exit(1);
                }
            }
        },

        Commands::Db { db_command } => match db_command {
            DbCommands::Add {
                remote,
                names,
                rank,
            } => {
                let rank = rank.map(|r| parse_rank(&remote.format, &r));
                run_reconciler(&remote, |r| r.add_names(&names, rank));
            }

            DbCommands::Fill { remote, names } => {
                run_reconciler(&remote, |r| r.fill(&names));
            }

            DbCommands::Uprank {
                remote,
                rank,
                names,
            } => {
                let rank = parse_rank(&remote.format, &rank);
                run_reconciler(&remote, |r| r.uprank(&names, rank));
            }

            DbCommands::Update { remote, match_only } => {
                run_reconciler(&remote, |r| r.update(match_only));
            }

            DbCommands::Sync { remote } => {
                run_reconciler(&remote, |r| r.sync());
            }
        },
    }
}
