//! CLI configuration (spec §6). Parsed with `argument-parser`, the same
//! dependency-light hand-rolled matcher the donor crate used for its own
//! (smaller) flag set.

use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use argument_parser::Parser;

#[derive(Debug, Clone)]
pub enum Mode {
    Normal,
    Hq,
    Remote {
        hq_url: String,
        name: String,
        token: String,
    },
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub no_auth: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub allow_local_bypass: bool,
    pub local_auth_token: Option<String>,
    pub enable_ssh_keys: bool,
    pub disallow_user_password: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub control_dir: PathBuf,
    pub auth: AuthConfig,
    pub mode: Mode,
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut parser = Parser::from_env();

        let mut port: u16 = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4020);
        let mut bind = "0.0.0.0".to_string();
        let mut control_dir = default_control_dir()?;
        let mut username = None::<String>;
        let mut password = None::<String>;
        let mut no_auth = false;
        let mut allow_local_bypass = false;
        let mut local_auth_token = None::<String>;
        let mut enable_ssh_keys = false;
        let mut disallow_user_password = false;
        let mut hq = false;
        let mut hq_url = None::<String>;
        let mut remote_name = None::<String>;
        let mut remote_token = None::<String>;

        while let Some(param) = parser.param()? {
            match param {
                p if p.is_long("port") => port = parser.value::<String>()?.parse()?,
                p if p.is_long("bind") => bind = parser.value()?,
                p if p.is_long("control-dir") => control_dir = parser.value()?,
                p if p.is_long("username") => username = Some(parser.value()?),
                p if p.is_long("password") => password = Some(parser.value()?),
                p if p.is_long("no-auth") => no_auth = true,
                p if p.is_long("allow-local-bypass") => allow_local_bypass = true,
                p if p.is_long("local-auth-token") => local_auth_token = Some(parser.value()?),
                p if p.is_long("enable-ssh-keys") => enable_ssh_keys = true,
                p if p.is_long("disallow-user-password") => disallow_user_password = true,
                p if p.is_long("hq") => hq = true,
                p if p.is_long("hq-url") => hq_url = Some(parser.value()?),
                p if p.is_long("name") => remote_name = Some(parser.value()?),
                p if p.is_long("token") => remote_token = Some(parser.value()?),
                p if p.is_long("help") => {
                    print_help();
                    std::process::exit(0);
                }
                _ => return Err(parser.unexpected().into()),
            }
        }

        let debug = env::var("DEBUG").as_deref() == Ok("1");

        let mode = if hq {
            Mode::Hq
        } else if let Some(hq_url) = hq_url {
            Mode::Remote {
                hq_url,
                name: remote_name
                    .ok_or_else(|| anyhow!("--hq-url requires --name"))?,
                token: remote_token
                    .ok_or_else(|| anyhow!("--hq-url requires --token"))?,
            }
        } else {
            Mode::Normal
        };

        Ok(Self {
            port,
            bind,
            control_dir,
            auth: AuthConfig {
                no_auth,
                username,
                password,
                allow_local_bypass,
                local_auth_token,
                enable_ssh_keys,
                disallow_user_password,
            },
            mode,
            debug,
        })
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn default_control_dir() -> Result<PathBuf> {
    if let Ok(dir) = env::var("CONTROL_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = env::home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
    Ok(home.join(".vibetunnel/control"))
}

fn print_help() {
    println!("Usage: vibetunneld [options]");
    println!("Options:");
    println!("  --port N                  Listen port (default 4020, or $PORT)");
    println!("  --bind ADDR               Bind address (default 0.0.0.0)");
    println!("  --control-dir PATH        Override $CONTROL_DIR");
    println!("  --username / --password   Enable basic auth");
    println!("  --no-auth                 Disable authentication");
    println!("  --allow-local-bypass      Localhost connections skip auth…");
    println!("  --local-auth-token T      …but only with header X-VibeTunnel-Local: T");
    println!("  --enable-ssh-keys         Accept SSH-key challenge auth");
    println!("  --disallow-user-password  Require SSH-key auth only");
    println!("  --hq                      Run as HQ");
    println!("  --hq-url URL --name N --token T   Run as remote, register with HQ");
    println!("  --help                    Show this help message");
}
