//! # rrlink CLI Entry Point
//!
//! Main binary for rrlink. Sends commands to devices over the local socket
//! or the cloud broker, and calls the cloud REST API.
//!
//! ## Usage
//!
//! ```bash
//! # Ask a device on the LAN for its status
//! rrlink local 192.168.1.20 get_status --key <local-key>
//!
//! # Same command through the cloud broker (keys from the login file)
//! rrlink command <duid> get_status
//!
//! # Print everything a device publishes
//! rrlink listen <duid>
//!
//! # Log in and save the printed JSON as the login file
//! rrlink login user@example.com --password '...' > rrlink-login.json
//!
//! # Home data with the v2 endpoint
//! rrlink home --version v2
//! ```
//!
//! Results are printed as JSON on stdout; logs go to stderr.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use argh::FromArgs;
use rrlink_cli::login::{self, LoginData};
use rrlink_cli::{parse_pairs, parse_params};
use rrlink_client::transport::{BrokerTransport, LocalConfig, LocalTransport, MqttSession, Transport};
use rrlink_client::{DeviceSession, Dispatcher, DispatcherConfig, HomeDataVersion, WebApiClient};
use rrlink_common::auth;
use rrlink_common::protocol::{Message, MessageBody};
use tokio::sync::mpsc;

/// Time allowed for the broker to accept the connection.
const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// rrlink - talk to appliances over the local socket or the cloud broker
struct Cli {
    /// enable debug logging
    #[argh(switch, short = 'd')]
    debug: bool,

    /// path to the login file
    ///
    /// Overrides the RRLINK_LOGIN_FILE environment variable.
    #[argh(option, long = "login-file")]
    login_file: Option<String>,

    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Local(LocalArgs),
    Command(CommandArgs),
    Listen(ListenArgs),
    Home(HomeArgs),
    Rooms(RoomsArgs),
    Scenes(ScenesArgs),
    ExecuteScene(ExecuteSceneArgs),
    Products(ProductsArgs),
    RequestCode(RequestCodeArgs),
    Login(LoginArgs),
    Sign(SignArgs),
}

/// Arguments for a command over the local socket.
///
/// The local key comes from `--key`, or from the login file entry of
/// `--duid`.
#[derive(FromArgs)]
#[argh(subcommand, name = "local")]
/// send one command over the local socket
struct LocalArgs {
    /// device IP address
    #[argh(positional)]
    ip: String,

    /// command name, e.g. get_status
    #[argh(positional)]
    method: String,

    /// command parameters as JSON
    #[argh(option, short = 'p', default = "String::new()")]
    params: String,

    /// device local key
    #[argh(option, short = 'k')]
    key: Option<String>,

    /// device id, used to look up the local key in the login file
    #[argh(option)]
    duid: Option<String>,

    /// device port
    #[argh(option, default = "58867")]
    port: u16,

    /// response timeout in milliseconds
    #[argh(option, short = 't', default = "10000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "command")]
/// send one command through the cloud broker
struct CommandArgs {
    /// device id
    #[argh(positional)]
    duid: String,

    /// command name, e.g. get_status
    #[argh(positional)]
    method: String,

    /// command parameters as JSON
    #[argh(option, short = 'p', default = "String::new()")]
    params: String,

    /// response timeout in milliseconds
    #[argh(option, short = 't', default = "10000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "listen")]
/// print everything a device publishes on the broker
struct ListenArgs {
    /// device id
    #[argh(positional)]
    duid: String,

    /// print undecoded payloads as hex
    #[argh(switch)]
    raw: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "home")]
/// fetch home data
struct HomeArgs {
    /// endpoint version: v1, v2 or v3
    #[argh(option, default = "HomeDataVersion::V1", from_str_fn(parse_version))]
    version: HomeDataVersion,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "rooms")]
/// list the rooms of the home
struct RoomsArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "scenes")]
/// list the scenes of a device
struct ScenesArgs {
    /// device id
    #[argh(positional)]
    duid: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "execute-scene")]
/// run a scene
struct ExecuteSceneArgs {
    /// scene id
    #[argh(positional)]
    scene_id: i64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "products")]
/// list the products of the account
struct ProductsArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "request-code")]
/// email a login code
struct RequestCodeArgs {
    /// account email
    #[argh(positional)]
    email: String,
}

/// Arguments for logging in.
///
/// Exactly one of `--password` and `--code` must be given. The login file
/// contents are printed on stdout.
#[derive(FromArgs)]
#[argh(subcommand, name = "login")]
/// log in and print login file contents
struct LoginArgs {
    /// account email
    #[argh(positional)]
    email: String,

    /// account password
    #[argh(option)]
    password: Option<String>,

    /// code received from request-code
    #[argh(option)]
    code: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "sign")]
/// print the Authorization header for a REST path
struct SignArgs {
    /// request path, e.g. /user/homes/123
    #[argh(positional)]
    path: String,

    /// query parameter as key=value (repeatable)
    #[argh(option, short = 'q')]
    query: Vec<String>,

    /// form parameter as key=value (repeatable)
    #[argh(option, short = 'f')]
    form: Vec<String>,
}

fn parse_version(value: &str) -> std::result::Result<HomeDataVersion, String> {
    value.parse().map_err(|e: rrlink_common::RrError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Logs go to stderr so stdout stays clean JSON
    let default_level = if cli.debug { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let login_path = login::resolve_path(cli.login_file.as_deref());

    match cli.command {
        Commands::Local(args) => run_local(args, &login_path).await,
        Commands::Command(args) => run_command(args, &login_path).await,
        Commands::Listen(args) => run_listen(args, &login_path).await,
        Commands::Home(args) => {
            let login = LoginData::load(&login_path)?;
            let home = web_client(&login)?
                .home_data(&login.user_data, args.version)
                .await?;
            print_json(&home)
        }
        Commands::Rooms(_) => {
            let login = LoginData::load(&login_path)?;
            let rooms = web_client(&login)?.rooms(&login.user_data, None).await?;
            print_json(&rooms)
        }
        Commands::Scenes(args) => {
            let login = LoginData::load(&login_path)?;
            let scenes = web_client(&login)?
                .scenes(&login.user_data, &args.duid)
                .await?;
            print_json(&scenes)
        }
        Commands::ExecuteScene(args) => {
            let login = LoginData::load(&login_path)?;
            web_client(&login)?
                .execute_scene(&login.user_data, args.scene_id)
                .await?;
            Ok(())
        }
        Commands::Products(_) => {
            let login = LoginData::load(&login_path)?;
            let products = web_client(&login)?.products(&login.user_data).await?;
            print_json(&products)
        }
        Commands::RequestCode(args) => {
            WebApiClient::new(&args.email)?.request_code().await?;
            tracing::info!("Code sent to {}", args.email);
            Ok(())
        }
        Commands::Login(args) => run_login(args).await,
        Commands::Sign(args) => {
            let login = LoginData::load(&login_path)?;
            let query = parse_pairs(&args.query)?;
            let form = parse_pairs(&args.form)?;
            let header = auth::sign(&login.credential(), &args.path, query.as_ref(), form.as_ref())?;
            println!("{}", header);
            Ok(())
        }
    }
}

fn web_client(login: &LoginData) -> Result<WebApiClient> {
    Ok(WebApiClient::new(&login.email)?)
}

/// Keeps the call result when closing afterwards fails; the close error is
/// only logged.
fn settle<T>(
    result: rrlink_common::Result<T>,
    close: rrlink_common::Result<()>,
) -> rrlink_common::Result<T> {
    if let Err(e) = close {
        tracing::warn!("shutdown after call failed: {}", e);
    }
    result
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Runs one command over the local socket and prints its result.
async fn run_local(args: LocalArgs, login_path: &Path) -> Result<()> {
    let params = parse_params(&args.params)?;

    let key = match (&args.key, &args.duid) {
        (Some(key), _) => key.clone(),
        (None, Some(duid)) => LoginData::load(login_path)?.device(duid)?.local_key.clone(),
        (None, None) => return Err(anyhow!("Either --key or --duid is required")),
    };
    let duid = args.duid.clone().unwrap_or_else(|| args.ip.clone());

    let transport = LocalTransport::new(&args.ip, key, LocalConfig::new().with_port(args.port));
    let session = DeviceSession::new(duid, Arc::new(transport));
    let dispatcher = Dispatcher::connect(session, DispatcherConfig::default()).await?;

    let result = dispatcher
        .call(&args.method, params, Some(Duration::from_millis(args.timeout_ms)))
        .await;
    let result = settle(result, dispatcher.close().await)?;

    print_json(&result)
}

/// Runs one command through the broker and prints its result.
async fn run_command(args: CommandArgs, login_path: &Path) -> Result<()> {
    let params = parse_params(&args.params)?;
    let login = LoginData::load(login_path)?;
    let device = login.device(&args.duid)?;

    let mqtt = MqttSession::connect(login.broker_params()?);
    mqtt.wait_connected(BROKER_CONNECT_TIMEOUT).await?;

    let transport = BrokerTransport::new(Arc::clone(&mqtt), &args.duid, device.local_key.clone());
    let session = DeviceSession::new(&args.duid, Arc::new(transport));
    let dispatcher = Dispatcher::connect(session, DispatcherConfig::default()).await?;

    let result = dispatcher
        .call(&args.method, params, Some(Duration::from_millis(args.timeout_ms)))
        .await;
    let result = settle(result, dispatcher.close().await);
    let result = settle(result, mqtt.disconnect().await)?;

    print_json(&result)
}

/// Prints device publishes until interrupted.
async fn run_listen(args: ListenArgs, login_path: &Path) -> Result<()> {
    let login = LoginData::load(login_path)?;
    let device = login.device(&args.duid)?;
    let params = login.broker_params()?;
    let topic = params.response_topic(&args.duid);

    let mqtt = MqttSession::connect(params);
    mqtt.wait_connected(BROKER_CONNECT_TIMEOUT).await?;
    tracing::info!("Listening on {}, press Ctrl-C to stop", topic);

    if args.raw {
        let (tx, mut rx) = mpsc::channel(64);
        let _subscription = mqtt.subscribe_raw(&topic, tx).await?;
        loop {
            tokio::select! {
                publish = rx.recv() => match publish {
                    Some(publish) => {
                        if publish.dropped > 0 {
                            tracing::warn!("{} publish(es) dropped before this one", publish.dropped);
                        }
                        println!("{}", hex(&publish.payload));
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    } else {
        let transport = BrokerTransport::new(Arc::clone(&mqtt), &args.duid, device.local_key.clone());
        transport.open().await?;
        let (tx, mut rx) = mpsc::channel(64);
        let _subscription = transport.subscribe(tx).await?;
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(Ok(message)) => println!("{}", describe(&message)),
                    Some(Err(e)) => tracing::warn!("{}", e),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        transport.close().await?;
    }

    mqtt.disconnect().await?;
    Ok(())
}

async fn run_login(args: LoginArgs) -> Result<()> {
    let client = WebApiClient::new(&args.email)?;
    let user_data = match (&args.password, &args.code) {
        (Some(password), None) => client.pass_login(password).await?,
        (None, Some(code)) => client.code_login(code).await?,
        _ => return Err(anyhow!("Exactly one of --password or --code is required")),
    };

    let login = LoginData::new(&args.email, user_data);
    println!("{}", serde_json::to_string_pretty(&login)?);
    Ok(())
}

fn describe(message: &Message) -> serde_json::Value {
    let body = match &message.body {
        MessageBody::Request(request) => serde_json::to_value(request).unwrap_or_default(),
        MessageBody::Response(response) => serde_json::to_value(response).unwrap_or_default(),
        MessageBody::Raw(bytes) => serde_json::json!({ "len": bytes.len(), "hex": hex(bytes) }),
    };
    serde_json::json!({
        "seq": message.seq,
        "timestamp": message.timestamp,
        "protocol": message.protocol.code(),
        "body": body,
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
