use std::{env, process};

use serde_json::json;

use graph_db_api::{
    ApiError, DbConfig, Deadline, GraphService, HealthStatus, OperationRequest, QueryDescriptor,
    backend::{Connector, SqliteConnector},
    cli::{Command, CommandLineConfig},
    logging::init_tracing,
};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        println!("{}", CommandLineConfig::help());
        return;
    }
    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    let cli = match CommandLineConfig::from_args(&arg_refs) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            eprint!("{}", CommandLineConfig::help());
            process::exit(2);
        }
    };
    if let Err(err) = init_tracing(&cli.log_level) {
        eprintln!("{err}");
        process::exit(2);
    }

    let (connector, service) = match open_service(&cli) {
        Ok(opened) => opened,
        Err(err) => {
            eprintln!("{err}");
            process::exit(2);
        }
    };

    let ok = run_command(&connector, &service, &cli);
    service.shutdown();
    if !ok {
        process::exit(1);
    }
}

fn open_service(
    cli: &CommandLineConfig,
) -> Result<(SqliteConnector, GraphService<SqliteConnector>), String> {
    let mut config = DbConfig::from_env().map_err(|e| e.to_string())?;
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    let connector = SqliteConnector::from_config(&config).map_err(|e| e.to_string())?;
    let service = GraphService::new(connector.clone(), &config).map_err(|e| e.to_string())?;
    Ok((connector, service))
}

fn print(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("failed to render output: {err}"),
    }
}

fn run_command(
    connector: &SqliteConnector,
    service: &GraphService<SqliteConnector>,
    cli: &CommandLineConfig,
) -> bool {
    match &cli.command {
        Command::Health => {
            let report = service.check_health();
            print(&report);
            report.status != HealthStatus::Unreachable
        }
        Command::Verify => {
            let report = service.verify_connectivity();
            print(&report);
            report.status
        }
        Command::InitSchema => match connector.ensure_schema() {
            Ok(version) => {
                print(&json!({ "schema_version": version }));
                true
            }
            Err(err) => {
                print(&ApiError::from(err));
                false
            }
        },
        Command::Status => {
            let health = service.check_health();
            print(&json!({
                "endpoint": connector.describe(),
                "liveness": service.liveness(),
                "health": health,
                "pool": service.pool_stats(),
            }));
            health.status != HealthStatus::Unreachable
        }
        Command::Query {
            template,
            params,
            mode,
        } => {
            let descriptor = match QueryDescriptor::with_params(template.clone(), params.clone()) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    print(&ApiError::from(err));
                    return false;
                }
            };
            let mut request = OperationRequest {
                descriptor,
                mode: *mode,
                deadline: Deadline::none(),
            };
            if let Some(timeout) = cli.timeout {
                request = request.with_timeout(timeout);
            }
            match service.run(request) {
                Ok(response) => {
                    print(&response);
                    true
                }
                Err(err) => {
                    print(&err);
                    false
                }
            }
        }
    }
}
