use rustpypi::{
    config::Config,
    runtime::{add_user, run_from_env, run_standalone},
};
use std::path::PathBuf;

const USAGE: &str = "\
Usage: rustpypi [OPTIONS]

Options:
  -c, --config <path>              Path to YAML config file
      --add-user <name:password>   Create a local upload user and exit
  -h, --help                       Print help

Users added while a server is running can log in right away.
";

#[derive(Debug, Default, PartialEq, Eq)]
struct CliOptions {
    config_path: Option<PathBuf>,
    add_user: Option<(String, String)>,
    help: bool,
}

fn parse_cli_args<I>(args: I) -> Result<CliOptions, String>
where
    I: IntoIterator<Item = String>,
{
    let mut options = CliOptions::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                options.help = true;
            }
            "-c" | "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| "missing value for --config".to_string())?;
                options.config_path = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--config=") => {
                let value = arg.trim_start_matches("--config=");
                if value.is_empty() {
                    return Err("missing value for --config".to_string());
                }
                options.config_path = Some(PathBuf::from(value));
            }
            "--add-user" => {
                let value = args
                    .next()
                    .ok_or_else(|| "missing value for --add-user".to_string())?;
                options.add_user = Some(parse_user_spec(&value)?);
            }
            _ if arg.starts_with("--add-user=") => {
                options.add_user = Some(parse_user_spec(arg.trim_start_matches("--add-user="))?);
            }
            _ => return Err(format!("unknown argument: {arg}")),
        }
    }
    Ok(options)
}

fn parse_user_spec(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((name, password)) if !name.is_empty() && !password.is_empty() => {
            Ok((name.to_string(), password.to_string()))
        }
        _ => Err("--add-user expects <name:password>".to_string()),
    }
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config, String> {
    match config_path {
        Some(path) => Config::from_env_with_config_file(path),
        None => Config::from_env(),
    }
}

#[tokio::main]
async fn main() {
    let options = match parse_cli_args(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{err}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    if options.help {
        println!("{USAGE}");
        return;
    }

    if let Some((username, password)) = options.add_user {
        let config = match load_config(options.config_path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("invalid configuration: {err}");
                std::process::exit(2);
            }
        };
        if let Err(err) = add_user(&config, &username, &password).await {
            eprintln!("could not create user {username}: {err}");
            std::process::exit(1);
        }
        println!("created user {username}");
        return;
    }

    let run_result = if let Some(config_path) = options.config_path {
        match Config::from_env_with_config_file(config_path) {
            Ok(config) => run_standalone(config).await,
            Err(err) => {
                eprintln!("invalid --config value: {err}");
                std::process::exit(2);
            }
        }
    } else {
        run_from_env().await
    };

    if let Err(err) = run_result {
        eprintln!("server error: {err}");
        std::process::exit(1);
    }
}
