use charvault::util::deep_merge;
use charvault::{BatchFileOperation, KbError, Store};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::process;

/// charvault CLI: manage a character knowledge base from the command line
#[derive(Parser)]
#[command(name = "charvault", version, about)]
struct Cli {
    /// Path to the data directory (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: String,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(clap::Args)]
struct ContentArgs {
    /// Read JSON content from a file
    #[arg(long)]
    content_file: Option<String>,
    /// Read JSON content from stdin
    #[arg(long)]
    content_stdin: bool,
    /// Top-level field values, applied over the content (e.g. --field total_level=2)
    #[arg(long = "field", value_parser = parse_key_value)]
    fields: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data directory if it does not exist
    Init,

    /// List character names
    Characters,

    /// List documents, optionally under a filename prefix
    List {
        /// Filename prefix (e.g. aragorn/)
        prefix: Option<String>,
    },

    /// Get a single document
    Get {
        /// Document filename (e.g. aragorn/character.json)
        filename: String,
    },

    /// Create a new document
    Create {
        filename: String,
        #[command(flatten)]
        content: ContentArgs,
    },

    /// Replace a document's content
    Update {
        filename: String,
        #[command(flatten)]
        content: ContentArgs,
        /// Reject the write unless the document is still at this version
        #[arg(long)]
        expected_version: Option<u64>,
    },

    /// Delete a document (runs a conflict check first)
    Delete {
        filename: String,
        /// Show the conflict check without deleting
        #[arg(long)]
        dry_run: bool,
        /// Delete even when the conflict check reports errors
        #[arg(long)]
        force: bool,
    },

    /// Copy a document to a new filename
    Duplicate { filename: String, new_filename: String },

    /// Validate content against a document type or filename
    Validate {
        /// Type name (e.g. spell_list) or filename
        target: String,
        #[command(flatten)]
        content: ContentArgs,
    },

    /// Show the schema of a document type
    Schema { type_name: String },

    /// Show the template of a document type
    Template { type_name: String },

    /// List supported document types
    Types,

    /// List backups, newest first
    Backups { filename: Option<String> },

    /// Restore a backup
    Restore { backup_id: String },

    /// Export a single document
    Export { filename: String },

    /// Export every document of a character
    ExportCharacter { name: String },

    /// Import an exported document or character bundle
    Import {
        /// Read the payload from a file instead of stdin
        #[arg(long)]
        file: Option<String>,
        /// New character name (bundle) or target filename (single document)
        #[arg(long)]
        name: Option<String>,
        /// Replace existing documents
        #[arg(long)]
        overwrite: bool,
    },

    /// Check what deleting or overwriting a document would affect
    Conflicts { filename: String },

    /// Run a JSON array of batch operations
    Batch {
        /// Read operations from a file instead of stdin
        #[arg(long)]
        file: Option<String>,
        /// Apply all operations or none
        #[arg(long)]
        atomic: bool,
    },

    /// Create a character's documents from the templates
    NewCharacter {
        name: String,
        /// Section content by type (e.g. --section 'character={"race":"Elf"}')
        #[arg(long = "section", value_parser = parse_key_value)]
        sections: Vec<(String, String)>,
    },

    /// Show document, character and backup counts
    Status,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = match cli.command {
        Command::Init => Store::init(&cli.data_dir)?,
        _ => Store::open(&cli.data_dir)?,
    };
    log::debug!("Opened store at {}", store.root().display());
    let format = &cli.format;

    match cli.command {
        Command::Init => {
            let status = store.status()?;
            print_output(&status, format)?;
        }

        Command::Characters => {
            print_output(&serde_json::to_value(store.list_characters()?)?, format)?;
        }

        Command::List { prefix } => {
            let docs = store.list_files(prefix.as_deref())?;
            print_output(&serde_json::to_value(docs)?, format)?;
        }

        Command::Get { filename } => {
            print_output(&serde_json::to_value(store.get_file(&filename)?)?, format)?;
        }

        Command::Create { filename, content } => {
            let doc = store.create_file(&filename, content_value(&content)?)?;
            print_output(&serde_json::to_value(doc)?, format)?;
        }

        Command::Update {
            filename,
            content,
            expected_version,
        } => {
            let value = content_value(&content)?;
            let doc = match expected_version {
                Some(version) => store.update_file_versioned(&filename, value, version)?,
                None => store.update_file(&filename, value)?,
            };
            print_output(&serde_json::to_value(doc)?, format)?;
        }

        Command::Delete {
            filename,
            dry_run,
            force,
        } => {
            let check = store.check_conflicts(&filename)?;
            if dry_run {
                print_output(
                    &serde_json::json!({ "dry_run": true, "conflict_check": check }),
                    format,
                )?;
            } else if check.has_errors() && !force {
                print_output(&serde_json::to_value(&check)?, format)?;
                return Err(format!("Refusing to delete {filename}: conflict check reported errors (use --force)").into());
            } else {
                let backup = store.delete_file(&filename)?;
                print_output(
                    &serde_json::json!({ "ok": true, "deleted": filename, "backup": backup }),
                    format,
                )?;
            }
        }

        Command::Duplicate {
            filename,
            new_filename,
        } => {
            let doc = store.duplicate_file(&filename, &new_filename)?;
            print_output(&serde_json::to_value(doc)?, format)?;
        }

        Command::Validate { target, content } => {
            let result = store.validate_content(&target, &content_value(&content)?)?;
            print_output(&serde_json::to_value(result)?, format)?;
        }

        Command::Schema { type_name } => {
            let schema = store.catalog().schema(&type_name)?;
            print_output(&serde_json::to_value(schema)?, format)?;
        }

        Command::Template { type_name } => {
            print_output(&store.catalog().template(&type_name)?, format)?;
        }

        Command::Types => {
            let types: BTreeMap<String, String> = store
                .catalog()
                .supported_types()
                .into_iter()
                .map(|(file_name, doc_type)| (doc_type.as_str().to_string(), file_name))
                .collect();
            print_output(&serde_json::to_value(types)?, format)?;
        }

        Command::Backups { filename } => {
            let backups = store.list_backups(filename.as_deref())?;
            print_output(&serde_json::to_value(backups)?, format)?;
        }

        Command::Restore { backup_id } => {
            let outcome = store.restore_backup(&backup_id)?;
            print_output(&serde_json::to_value(outcome)?, format)?;
        }

        Command::Export { filename } => {
            print_output(&serde_json::to_value(store.export_file(&filename)?)?, format)?;
        }

        Command::ExportCharacter { name } => {
            print_output(&serde_json::to_value(store.export_character(&name)?)?, format)?;
        }

        Command::Import {
            file,
            name,
            overwrite,
        } => {
            let payload = read_input(file.as_deref())?;
            let result = store.import_payload(&payload, name.as_deref(), overwrite)?;
            print_output(&serde_json::to_value(result)?, format)?;
        }

        Command::Conflicts { filename } => {
            print_output(&serde_json::to_value(store.check_conflicts(&filename)?)?, format)?;
        }

        Command::Batch { file, atomic } => {
            let payload = read_input(file.as_deref())?;
            let operations: Vec<BatchFileOperation> = serde_json::from_str(&payload)
                .map_err(|e| KbError::Malformed(format!("invalid batch operations: {e}")))?;
            let report = if atomic {
                store.execute_batch_atomic(operations)
            } else {
                store.execute_batch(operations)
            };
            print_output(&serde_json::to_value(report)?, format)?;
        }

        Command::NewCharacter { name, sections } => {
            let mut parsed = BTreeMap::new();
            for (type_name, text) in sections {
                let value: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|e| format!("Section '{type_name}' is not valid JSON: {e}"))?;
                parsed.insert(type_name, value);
            }
            let report = store.create_character(&name, &parsed)?;
            print_output(&serde_json::to_value(report)?, format)?;
        }

        Command::Status => {
            print_output(&store.status()?, format)?;
        }
    }

    Ok(())
}

fn print_output(value: &serde_json::Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value)?);
        }
    }
    Ok(())
}

/// Content from a file or stdin (or an empty object), with `--field` values
/// applied on top.
fn content_value(args: &ContentArgs) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let mut content = match read_content(args.content_file.as_deref(), args.content_stdin)? {
        Some(text) => serde_json::from_str(&text)
            .map_err(|e| KbError::Malformed(format!("content is not valid JSON: {e}")))?,
        None => serde_json::Value::Object(serde_json::Map::new()),
    };
    if !args.fields.is_empty() {
        deep_merge(&mut content, &fields_to_value(&args.fields));
    }
    Ok(content)
}

fn fields_to_value(fields: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, val) in fields {
        // Try to parse as JSON value (for numbers, booleans, arrays, objects)
        let json_val = serde_json::from_str(val).unwrap_or(serde_json::Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    serde_json::Value::Object(map)
}

fn read_content(
    content_file: Option<&str>,
    content_stdin: bool,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    if let Some(path) = content_file {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read content file '{path}': {e}"))?;
        Ok(Some(content))
    } else if content_stdin {
        read_input(None).map(Some)
    } else {
        Ok(None)
    }
}

/// Whole payload from a file, or from stdin when no file is given
fn read_input(file: Option<&str>) -> Result<String, Box<dyn std::error::Error>> {
    match file {
        Some(path) => Ok(std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read '{path}': {e}"))?),
        None => {
            use std::io::Read;
            let mut content = String::new();
            std::io::stdin().read_to_string(&mut content)?;
            Ok(content)
        }
    }
}
