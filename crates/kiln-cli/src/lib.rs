mod dev;

use kiln_core::{ApiDataResponse, FormData, FormDefinition, FormSession, RenderTarget};
use kiln_web::{
    Bridge, ConnectionStatus, FormApi, KilnConfig, LiveSync, attach_session, share,
};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub use dev::run_dev_server;

#[derive(Debug, Clone, PartialEq)]
enum CliCommand {
    Render {
        file: PathBuf,
        data: Option<String>,
        target: RenderTarget,
    },
    Validate {
        file: PathBuf,
        data: Option<String>,
    },
    Project {
        file: PathBuf,
        data: Option<String>,
    },
    Preview {
        id: String,
        draft: bool,
        config: Option<PathBuf>,
    },
    Dev {
        template: PathBuf,
        data: Option<PathBuf>,
        id: String,
        port: u16,
    },
}

pub async fn run_from_env() -> Result<(), String> {
    run_from_args(env::args().skip(1).collect()).await
}

pub async fn run_from_args(args: Vec<String>) -> Result<(), String> {
    let command = parse_command(args)?;
    debug!(?command, "running command");

    match command {
        CliCommand::Render { file, data, target } => {
            let mut session = load_session(&file, data)?;
            let output = session.render(target);
            print_json(&output)
        }
        CliCommand::Validate { file, data } => {
            let mut session = load_session(&file, data)?;
            let report = session.validate_all();
            print_json(&report)?;
            if report.valid {
                Ok(())
            } else {
                Err(format!("{} field(s) failed validation", report.errors.len()))
            }
        }
        CliCommand::Project { file, data } => {
            let session = load_session(&file, data)?;
            print_json(&session.project())
        }
        CliCommand::Preview { id, draft, config } => run_preview(id, draft, config).await,
        CliCommand::Dev {
            template,
            data,
            id,
            port,
        } => run_dev_server(template, data, id, port).await,
    }
}

fn parse_command(args: Vec<String>) -> Result<CliCommand, String> {
    if args.is_empty() {
        return Err(help_text());
    }

    let cmd = args[0].as_str();
    match cmd {
        "render" | "validate" | "project" => parse_document_command(args),
        "preview" => parse_preview(args),
        "dev" => parse_dev(args),
        "help" | "--help" | "-h" => Err(help_text()),
        _ => Err(format!("unknown command: {cmd}\n\n{}", help_text())),
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a String, String> {
    args.get(i).ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_document_command(args: Vec<String>) -> Result<CliCommand, String> {
    let cmd = args[0].clone();
    let mut file: Option<PathBuf> = None;
    let mut data: Option<String> = None;
    let mut target = RenderTarget::Web;

    let mut i = 1usize;
    while i < args.len() {
        let token = &args[i];
        match token.as_str() {
            "--data" => {
                i += 1;
                data = Some(flag_value(&args, i, "--data")?.to_string());
            }
            "--target" if cmd == "render" => {
                i += 1;
                target = match flag_value(&args, i, "--target")?.as_str() {
                    "web" => RenderTarget::Web,
                    "pdf" => RenderTarget::Pdf,
                    other => return Err(format!("invalid target: {other} (expected web or pdf)")),
                };
            }
            x if x.starts_with("--") => return Err(format!("unknown flag: {x}")),
            _ => {
                if file.is_some() {
                    return Err("only one FILE positional argument is allowed".to_string());
                }
                file = Some(PathBuf::from(token));
            }
        }
        i += 1;
    }

    let file = file.ok_or_else(|| format!("{cmd} requires FILE"))?;
    Ok(match cmd.as_str() {
        "render" => CliCommand::Render { file, data, target },
        "validate" => CliCommand::Validate { file, data },
        _ => CliCommand::Project { file, data },
    })
}

fn parse_preview(args: Vec<String>) -> Result<CliCommand, String> {
    let mut id: Option<String> = None;
    let mut draft = false;
    let mut config: Option<PathBuf> = None;

    let mut i = 1usize;
    while i < args.len() {
        let token = &args[i];
        match token.as_str() {
            "--draft" => draft = true,
            "--config" => {
                i += 1;
                config = Some(PathBuf::from(flag_value(&args, i, "--config")?));
            }
            x if x.starts_with("--") => return Err(format!("unknown flag: {x}")),
            _ => {
                if id.is_some() {
                    return Err("only one ID positional argument is allowed".to_string());
                }
                id = Some(token.clone());
            }
        }
        i += 1;
    }

    let id = id.ok_or_else(|| "preview requires ID".to_string())?;
    Ok(CliCommand::Preview { id, draft, config })
}

fn parse_dev(args: Vec<String>) -> Result<CliCommand, String> {
    let mut template: Option<PathBuf> = None;
    let mut data: Option<PathBuf> = None;
    let mut id = "1".to_string();
    let mut port: u16 = 8000;

    let mut i = 1usize;
    while i < args.len() {
        let token = &args[i];
        match token.as_str() {
            "--data" => {
                i += 1;
                data = Some(PathBuf::from(flag_value(&args, i, "--data")?));
            }
            "--id" => {
                i += 1;
                id = flag_value(&args, i, "--id")?.to_string();
            }
            "--port" => {
                i += 1;
                let value = flag_value(&args, i, "--port")?;
                port = value
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port: {value}"))?;
            }
            x if x.starts_with("--") => return Err(format!("unknown flag: {x}")),
            _ => {
                if template.is_some() {
                    return Err("only one TEMPLATE positional argument is allowed".to_string());
                }
                template = Some(PathBuf::from(token));
            }
        }
        i += 1;
    }

    let template = template.ok_or_else(|| "dev requires TEMPLATE".to_string())?;
    Ok(CliCommand::Dev {
        template,
        data,
        id,
        port,
    })
}

fn help_text() -> String {
    [
        "kiln CLI",
        "",
        "Commands:",
        "  kiln render FILE [--data JSON_OR_PATH] [--target web|pdf]",
        "  kiln validate FILE [--data JSON_OR_PATH]",
        "  kiln project FILE [--data JSON_OR_PATH]",
        "  kiln preview ID [--draft] [--config PATH]",
        "  kiln dev TEMPLATE [--data FILE] [--id 1] [--port 8000]",
        "",
        "FILE is a template, an API document ({\"form_template\": ...}) or a",
        "loaded document ({\"form_definition\": ..., \"data\": ...}).",
    ]
    .join("\n")
}

fn print_json(value: &impl serde::Serialize) -> Result<(), String> {
    let pretty = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{pretty}");
    Ok(())
}

fn load_session(file: &Path, data: Option<String>) -> Result<FormSession, String> {
    let source =
        fs::read_to_string(file).map_err(|e| format!("failed to read {}: {e}", file.display()))?;
    let root: Value = serde_json::from_str(&source)
        .map_err(|e| format!("failed to parse {}: {e}", file.display()))?;
    let mut form_data = form_data_from_value(root)
        .map_err(|e| format!("invalid document {}: {e}", file.display()))?;

    if let Some(values) = load_data_payload(data)? {
        let Value::Object(values) = values else {
            return Err("--data must be a JSON object of field values".to_string());
        };
        form_data.data.extend(values);
    }
    Ok(FormSession::load(form_data))
}

/// Accepts the three document shapes the CLI reads.
fn form_data_from_value(root: Value) -> Result<FormData, serde_json::Error> {
    let shape = root
        .as_object()
        .map(|obj| (obj.contains_key("form_template"), obj.contains_key("form_definition")));
    match shape {
        Some((true, _)) => {
            let response: ApiDataResponse = serde_json::from_value(root)?;
            Ok(FormData::from_api_response(response))
        }
        Some((false, true)) => serde_json::from_value(root),
        _ => {
            let definition: FormDefinition = serde_json::from_value(root)?;
            Ok(FormData::from_template(definition))
        }
    }
}

fn load_data_payload(data: Option<String>) -> Result<Option<Value>, String> {
    let Some(input) = data else {
        return Ok(None);
    };

    let as_path = PathBuf::from(&input);
    if as_path.exists() {
        let content = fs::read_to_string(&as_path)
            .map_err(|e| format!("failed to read {}: {e}", as_path.display()))?;
        let parsed = serde_json::from_str::<Value>(&content)
            .map_err(|e| format!("invalid JSON in {}: {e}", as_path.display()))?;
        return Ok(Some(parsed));
    }

    let parsed =
        serde_json::from_str::<Value>(&input).map_err(|e| format!("invalid --data JSON: {e}"))?;
    Ok(Some(parsed))
}

async fn run_preview(id: String, draft: bool, config: Option<PathBuf>) -> Result<(), String> {
    let config = KilnConfig::load(config.as_deref()).map_err(|e| e.to_string())?;
    let api = FormApi::new(&config);

    let fetch_api = api.clone();
    let fetch_id = id.clone();
    let response = tokio::task::spawn_blocking(move || fetch_api.fetch_document(&fetch_id, draft))
        .await
        .map_err(|e| format!("fetch task failed: {e}"))?
        .map_err(|e| e.to_string())?;

    let session = share(FormSession::load(FormData::from_api_response(response)));
    let bridge = Bridge::new(config.bridge);
    let registered = attach_session(&bridge, &session);
    let watcher = bridge.spawn_watcher();
    print_field_summary(&bridge, &session, "loaded");
    info!(%id, draft, fields = registered, "preview started");

    let handle = LiveSync::new(Arc::new(api), session.clone(), id.clone(), draft, config.sync)
        .with_bridge(bridge.clone())
        .connect(&config.reverb);
    let mut status = handle.status_receiver();
    let mut refreshes = handle.refresh_receiver();

    println!("kiln preview");
    println!("Form version: {id}{}", if draft { " (draft)" } else { "" });
    println!("Channel:      {}", kiln_web::channel_name(&id, draft));
    println!("Socket:       {}", config.reverb.socket_url());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                println!("[sync] {}", status_label(current));
            }
            changed = refreshes.changed() => {
                if changed.is_err() {
                    break;
                }
                let _ = *refreshes.borrow_and_update();
                print_field_summary(&bridge, &session, "template updated");
            }
        }
    }

    handle.stop().await;
    watcher.abort();
    Ok(())
}

fn status_label(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Connecting => "connecting",
        ConnectionStatus::Connected => "connected",
        ConnectionStatus::Disconnected => "disconnected",
        ConnectionStatus::Error => "error",
    }
}

fn print_field_summary(bridge: &Bridge, session: &kiln_web::SharedSession, label: &str) {
    let output = kiln_web::render_and_mirror(bridge, session, RenderTarget::Web);
    println!("[{label}] {} visible field(s)", output.fields.len());
    for field in &output.fields {
        let value = match &field.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        println!("  {:<32} {}", field.id, value);
    }
}
