use anyhow::{Context, Result, bail};
use base64::Engine;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use teamflow::client::{TeamflowClient, default_addr, error_code};
use teamflow::protocol::{Request, Response};
use teamflow_core::model::{
    Capability, ContentPatch, ContentTarget, MemberPatch, NewTemplateStep, StepContent,
};

#[derive(Parser)]
#[command(name = "teamflow", version, about = "teamflow session CLI")]
struct Cli {
    /// Server address (host:port).
    #[arg(long, global = true, env = "TEAMFLOW_ADDR")]
    addr: Option<String>,

    /// Bearer token identifying you to the server.
    #[arg(long, global = true, env = "TEAMFLOW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Health check. Needs no token.
    Health,
    /// Show the user your token resolves to.
    Whoami,

    // -- Templates and sessions --
    /// Create a template from step names or a JSON file of steps.
    CreateTemplate {
        name: String,
        /// Step name, in order (repeatable).
        #[arg(long = "step")]
        steps: Vec<String>,
        /// JSON array of steps: {"name", "description", "objective",
        /// "instructions", "proof": {"required", "instructions"}}.
        #[arg(long, conflicts_with = "steps")]
        file: Option<PathBuf>,
    },
    /// Launch a session from a template you own.
    CreateSession { template_id: String, name: String },
    DeleteSession { session_id: String },
    /// List sessions you own or belong to.
    Sessions,
    /// Show a session as you see it.
    Context { session_id: String },

    // -- Members --
    AddMember {
        session_id: String,
        user_id: String,
        /// Capability to grant (repeatable), e.g. edit_steps, chat.
        #[arg(long = "grant", value_parser = parse_capability)]
        grant: Vec<Capability>,
        #[arg(long)]
        lane_color: Option<String>,
    },
    UpdateMember {
        session_id: String,
        user_id: String,
        #[arg(long = "grant", value_parser = parse_capability)]
        grant: Vec<Capability>,
        #[arg(long = "revoke", value_parser = parse_capability)]
        revoke: Vec<Capability>,
        /// New lane colour; an empty string clears it.
        #[arg(long)]
        lane_color: Option<String>,
    },
    RemoveMember { session_id: String, user_id: String },

    // -- Assignments and delegation --
    Assign {
        session_id: String,
        step_id: String,
        assignee: String,
        #[arg(long)]
        allow_delegation: bool,
        /// Anyone in the session may stand in. Implies --allow-delegation.
        #[arg(long)]
        everyone: bool,
    },
    UpdateAssignment {
        assignment_id: String,
        #[arg(long)]
        allow_delegation: bool,
        #[arg(long)]
        everyone: bool,
    },
    Unassign { assignment_id: String },
    AddDelegate {
        assignment_id: String,
        delegate: String,
    },
    RemoveDelegate {
        assignment_id: String,
        delegate: String,
    },
    AddLaneDelegate {
        session_id: String,
        owner: String,
        delegate: String,
    },
    RemoveLaneDelegate {
        session_id: String,
        owner: String,
        delegate: String,
    },

    // -- Steps and proof --
    Complete { session_step_id: String },
    EditStep {
        session_step_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        objective: Option<String>,
        #[arg(long)]
        instructions: Option<String>,
        /// Change this session only instead of the shared template.
        #[arg(long)]
        session_only: bool,
    },
    ProofConfig {
        session_step_id: String,
        #[arg(long)]
        required: bool,
        #[arg(long)]
        instructions: Option<String>,
    },
    SubmitProof {
        session_step_id: String,
        content: String,
    },
    UploadProof {
        session_step_id: String,
        path: PathBuf,
    },
    DeleteProof { session_step_id: String },
    ProofUrl { session_step_id: String },

    // -- Chat --
    Say { session_id: String, message: String },
    Read {
        session_id: String,
        message_ids: Vec<String>,
    },
    DeleteMessage { message_id: String },

    /// Print change events for a session until interrupted.
    Watch { session_id: String },
}

fn parse_capability(s: &str) -> Result<Capability, String> {
    serde_json::from_value(serde_json::Value::String(s.replace('-', "_"))).map_err(|_| {
        let names: Vec<String> = Capability::ALL.iter().map(|c| c.to_string()).collect();
        format!("unknown capability '{s}' (expected one of: {})", names.join(", "))
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(error_code(&e).map_or(1, |code| code.exit_code()));
    }
}

async fn run(cli: Cli) -> Result<()> {
    let addr = cli.addr.unwrap_or_else(default_addr);

    let mut client = TeamflowClient::connect(&addr).await?;
    if !matches!(cli.command, Command::Health) {
        let token = cli
            .token
            .as_deref()
            .context("no token: pass --token or set TEAMFLOW_TOKEN")?;
        client.authenticate(token).await?;
    }

    let req = match cli.command {
        Command::Health => Request::Health,
        Command::Whoami => {
            println!("{}", client.user_id().unwrap_or_default());
            return Ok(());
        }
        Command::Watch { session_id } => return watch(client, session_id).await,

        Command::CreateTemplate { name, steps, file } => {
            let steps = match file {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str::<Vec<NewTemplateStep>>(&raw)
                        .with_context(|| format!("invalid steps in {}", path.display()))?
                }
                None => steps
                    .into_iter()
                    .map(|name| NewTemplateStep {
                        content: StepContent {
                            name,
                            ..StepContent::default()
                        },
                        ..NewTemplateStep::default()
                    })
                    .collect(),
            };
            Request::CreateTemplate { name, steps }
        }
        Command::CreateSession { template_id, name } => Request::CreateSession { template_id, name },
        Command::DeleteSession { session_id } => Request::DeleteSession { session_id },
        Command::Sessions => Request::ListSessions,
        Command::Context { session_id } => Request::SessionContext { session_id },

        Command::AddMember {
            session_id,
            user_id,
            grant,
            lane_color,
        } => Request::AddMember {
            session_id,
            user_id,
            capabilities: grant,
            lane_color,
        },
        Command::UpdateMember {
            session_id,
            user_id,
            grant,
            revoke,
            lane_color,
        } => Request::UpdateMember {
            session_id,
            user_id,
            patch: MemberPatch {
                grant,
                revoke,
                lane_color,
            },
        },
        Command::RemoveMember {
            session_id,
            user_id,
        } => Request::RemoveMember {
            session_id,
            user_id,
        },

        Command::Assign {
            session_id,
            step_id,
            assignee,
            allow_delegation,
            everyone,
        } => Request::AssignStep {
            session_id,
            step_id,
            assignee_user_id: assignee,
            allow_delegation,
            allow_delegation_to_everyone: everyone,
        },
        Command::UpdateAssignment {
            assignment_id,
            allow_delegation,
            everyone,
        } => Request::UpdateAssignment {
            assignment_id,
            allow_delegation,
            allow_delegation_to_everyone: everyone,
        },
        Command::Unassign { assignment_id } => Request::RemoveAssignment { assignment_id },
        Command::AddDelegate {
            assignment_id,
            delegate,
        } => Request::AddAssignmentDelegate {
            assignment_id,
            delegate_user_id: delegate,
        },
        Command::RemoveDelegate {
            assignment_id,
            delegate,
        } => Request::RemoveAssignmentDelegate {
            assignment_id,
            delegate_user_id: delegate,
        },
        Command::AddLaneDelegate {
            session_id,
            owner,
            delegate,
        } => Request::AddLaneDelegate {
            session_id,
            owner_user_id: owner,
            delegate_user_id: delegate,
        },
        Command::RemoveLaneDelegate {
            session_id,
            owner,
            delegate,
        } => Request::RemoveLaneDelegate {
            session_id,
            owner_user_id: owner,
            delegate_user_id: delegate,
        },

        Command::Complete { session_step_id } => Request::CompleteStep { session_step_id },
        Command::EditStep {
            session_step_id,
            name,
            description,
            objective,
            instructions,
            session_only,
        } => {
            let fields = ContentPatch {
                name,
                description,
                objective,
                instructions,
            };
            if fields.is_empty() {
                bail!("nothing to edit: pass at least one of --name, --description, --objective, --instructions");
            }
            Request::EditStepContent {
                session_step_id,
                fields,
                target: if session_only {
                    ContentTarget::Session
                } else {
                    ContentTarget::Template
                },
            }
        }
        Command::ProofConfig {
            session_step_id,
            required,
            instructions,
        } => Request::SetProofConfig {
            session_step_id,
            required,
            instructions,
        },
        Command::SubmitProof {
            session_step_id,
            content,
        } => Request::SubmitProof {
            session_step_id,
            content,
        },
        Command::UploadProof {
            session_step_id,
            path,
        } => {
            let bytes =
                std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .context("path has no file name")?;
            Request::UploadProof {
                session_step_id,
                file_name,
                data_b64: base64::engine::general_purpose::STANDARD.encode(bytes),
            }
        }
        Command::DeleteProof { session_step_id } => Request::DeleteProof { session_step_id },
        Command::ProofUrl { session_step_id } => Request::ProofUrl { session_step_id },

        Command::Say {
            session_id,
            message,
        } => Request::SendMessage {
            session_id,
            content: message,
        },
        Command::Read {
            session_id,
            message_ids,
        } => Request::MarkRead {
            session_id,
            message_ids,
        },
        Command::DeleteMessage { message_id } => Request::DeleteMessage { message_id },
    };

    let data = client.request(req).await?;
    match data {
        Some(_) => print_json(&data),
        None => println!("OK"),
    }
    Ok(())
}

async fn watch(mut client: TeamflowClient, session_id: String) -> Result<()> {
    let user_id = client
        .user_id()
        .context("not authenticated")?
        .to_string();
    client
        .request(Request::Subscribe {
            session_id: session_id.clone(),
            user_id,
        })
        .await?;
    eprintln!("Watching session {session_id}. Ctrl-C to stop.");

    let (_writer, mut reader) = client.into_split();
    loop {
        tokio::select! {
            frame = reader.next() => {
                let Some(frame) = frame else {
                    bail!("server disconnected");
                };
                if let Response::Event { event } = frame? {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn print_json(data: &Option<serde_json::Value>) {
    if let Some(v) = data {
        match serde_json::to_string_pretty(v) {
            Ok(s) => println!("{s}"),
            Err(_) => println!("{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn capabilities_parse_in_either_spelling() {
        assert_eq!(parse_capability("edit_steps").unwrap(), Capability::EditSteps);
        assert_eq!(
            parse_capability("manage-assignments").unwrap(),
            Capability::ManageAssignments
        );
        assert!(parse_capability("root").is_err());
    }

    #[test]
    fn assign_flags_map_to_request() {
        let cli = Cli::try_parse_from([
            "teamflow", "assign", "sess", "step", "bob", "--everyone",
        ])
        .unwrap();
        match cli.command {
            Command::Assign {
                everyone,
                allow_delegation,
                ..
            } => {
                assert!(everyone);
                assert!(!allow_delegation);
            }
            _ => panic!("expected assign"),
        }
    }
}
