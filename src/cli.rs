//! Command line interface of the `streamrpc` binary
use anyhow::Context as _;
use structopt::StructOpt;

use crate::crypto::{CryptoOption, SecretBox};
use crate::{Client, ClientConfig, Payload, Server, ServerConfig, Service, Session, TcpDialer};

pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Cli::from_args();
    args.command.run(args.options).await
}

/// Serve and call RPCs over streamrpc sessions
#[derive(StructOpt)]
#[structopt(name = "streamrpc", max_term_width = 100)]
struct Cli {
    #[structopt(subcommand)]
    command: Command,

    #[structopt(flatten)]
    options: Options,
}

#[derive(StructOpt)]
struct Options {
    /// Base64 encoded 32 byte pre-shared key. Without a key connections are not encrypted.
    #[structopt(long, parse(try_from_str = Options::parse_psk))]
    psk: Option<SecretBox>,
}

impl Options {
    fn crypto_options(&self) -> Vec<CryptoOption> {
        match &self.psk {
            Some(psk) => vec![CryptoOption::new("psk", psk.clone(), 1)],
            None => vec![CryptoOption::plaintext()],
        }
    }

    async fn session(&self, server: &str) -> anyhow::Result<(Client, Session)> {
        let client = Client::new(ClientConfig {
            crypto_options: self.crypto_options(),
            ..ClientConfig::default()
        })?;
        let session = client
            .dial(&TcpDialer, "tcp", server)
            .await
            .context(format!("Failed to connect to {}", server))?;
        Ok((client, session))
    }

    fn parse_psk(value: &str) -> anyhow::Result<SecretBox> {
        let bytes = base64::decode(value)?;
        Ok(SecretBox::new(&bytes)?)
    }
}

#[derive(StructOpt)]
enum Command {
    Serve(Serve),
    Call(Call),
    Ping(Ping),
}

impl Command {
    async fn run(&self, options: Options) -> anyhow::Result<()> {
        match self {
            Self::Serve(cmd) => cmd.run(options).await,
            Self::Call(cmd) => cmd.run(options).await,
            Self::Ping(cmd) => cmd.run(options).await,
        }
    }
}

#[derive(StructOpt)]
/// Run a server with an `echo` RPC and an `echo` stream
struct Serve {
    #[structopt(long, default_value = "127.0.0.1:8700")]
    listen: String,
}

impl Serve {
    async fn run(&self, options: Options) -> anyhow::Result<()> {
        let mut service = Service::new();
        service
            .add_rpc("echo", |request| async move { Ok(request.payload) })
            .add_stream("echo", |stream| async move {
                loop {
                    match stream.recv().await {
                        Ok(payload) => stream.send(payload)?,
                        Err(crate::Error::StreamClosed) => return Ok(()),
                        Err(error) => return Err(error.into()),
                    }
                }
            });
        let server = Server::new(
            ServerConfig {
                crypto_options: options.crypto_options(),
                ..ServerConfig::default()
            },
            service,
        );
        let listener = async_std::net::TcpListener::bind(&self.listen)
            .await
            .context(format!("Failed to listen on {}", self.listen))?;
        tracing::info!(address = ?listener.local_addr()?, "listening");
        server.serve(listener).await?;
        Ok(())
    }
}

#[derive(StructOpt)]
/// Call an RPC and print the response
struct Call {
    #[structopt(long, default_value = "127.0.0.1:8700")]
    server: String,

    header: String,

    /// Sent as a text payload
    #[structopt(default_value = "")]
    payload: String,
}

impl Call {
    async fn run(&self, options: Options) -> anyhow::Result<()> {
        let (client, session) = options.session(&self.server).await?;
        let response = session
            .rpc(&self.header, self.payload.as_str())
            .await
            .context(format!("Call to {:?} failed", self.header));
        client.close();
        let response = match response? {
            Payload::Text(text) => text,
            Payload::Json(data) => {
                let value = serde_json::from_slice::<serde_json::Value>(&data)
                    .context("Failed to decode response")?;
                serde_json::to_string_pretty(&value)?
            }
            Payload::Raw(_data) => "Refusing to print binary data".to_string(),
            Payload::Error(message) => anyhow::bail!("RPC error: {}", message),
        };
        println!("{}", response);
        Ok(())
    }
}

#[derive(StructOpt)]
/// Measure the round trip delay to a server
struct Ping {
    #[structopt(long, default_value = "127.0.0.1:8700")]
    server: String,
}

impl Ping {
    async fn run(&self, options: Options) -> anyhow::Result<()> {
        let (client, session) = options.session(&self.server).await?;
        let delay = session.round_trip_delay().await;
        client.close();
        println!("{:?}", delay?);
        Ok(())
    }
}
