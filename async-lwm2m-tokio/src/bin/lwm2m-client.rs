// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! A LwM2M client driven by control commands on stdin.
//!
//! ```text
//! lwm2m-client -s coap://127.0.0.1:5683 -e urn:dev:os:test
//! ```
//!
//! Each line on stdin is one command, for example `enter-offline udp`,
//! `get-fw-offset` or `quit`. Closing stdin deregisters and exits.

use async_lwm2m::client::Lwm2mClient;
use async_lwm2m::config::{ClientConfig, ConfigError};
use async_lwm2m::control::ControlCommand;
use async_lwm2m_tokio::{Exit, Runtime, RuntimeError, Storage};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Command line arguments. Each one overrides the configuration file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server URI, e.g. coap://127.0.0.1:5683. May be repeated.
    #[arg(short, long = "server", required = true)]
    servers: Vec<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Endpoint client name
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Registration lifetime in seconds
    #[arg(short, long)]
    lifetime: Option<u32>,

    /// Binding mode
    #[arg(short, long)]
    binding: Option<String>,

    /// Register in queue mode
    #[arg(short, long)]
    queue_mode: bool,

    /// Directory for packages and persisted state
    #[arg(short, long)]
    persistence_dir: Option<PathBuf>,

    /// Firmware package file
    #[arg(long)]
    fw_package_path: Option<PathBuf>,

    /// Preferred block size, 16 to 1024
    #[arg(long)]
    block_size: Option<usize>,

    /// Notifications kept while offline
    #[arg(long)]
    stored_notification_limit: Option<usize>,

    /// Report update results with a LwM2M Send
    #[arg(long)]
    send_on_update: bool,

    /// Refuse to repeat the current software activation state
    #[arg(long)]
    sw_disable_repeated_activation: bool,
}

impl Args {
    fn config(&self) -> Result<ClientConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_json(path)?,
            None => ClientConfig::default(),
        };

        if let Some(endpoint) = &self.endpoint {
            config.endpoint_name = endpoint.clone();
        }
        if let Some(lifetime) = self.lifetime {
            config.lifetime = lifetime;
        }
        if let Some(binding) = &self.binding {
            config.binding = Some(binding.clone());
        }
        if let Some(dir) = &self.persistence_dir {
            config.persistence_dir = Some(dir.clone());
        }
        if let Some(path) = &self.fw_package_path {
            config.fw_package_path = Some(path.clone());
        }
        if let Some(size) = self.block_size {
            config.block_size = size;
        }
        if let Some(limit) = self.stored_notification_limit {
            config.stored_notification_limit = limit;
        }
        config.queue_mode |= self.queue_mode;
        config.send_on_update |= self.send_on_update;
        config.sw_disable_repeated_activation |= self.sw_disable_repeated_activation;

        config.validate()?;
        Ok(config)
    }
}

async fn read_commands(tx: UnboundedSender<ControlCommand>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => (),
            Ok(Some(line)) => match line.parse() {
                Ok(command) => {
                    if tx.send(command).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("{:?}: {}", line, e),
            },
            Ok(None) => return,
            Err(e) => {
                error!("stdin: {}", e);
                return;
            }
        }
    }
}

async fn run(
    mut servers: Vec<String>,
    config: ClientConfig,
    commands: &mut UnboundedReceiver<ControlCommand>,
) -> Result<(), RuntimeError> {
    let storage = Storage::for_config(&config);

    loop {
        let objects = storage.objects(&config)?;
        let mut runtime = Runtime::new(Lwm2mClient::new(config.clone(), objects))?;
        for uri in &servers {
            runtime.add_server(uri).await?;
        }

        match runtime.run(commands).await? {
            Exit::Deregistered => return Ok(()),
            Exit::Restart => {
                info!("restarting");
                servers = runtime.server_uris();
            }
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match args.config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("cannot start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = rt.block_on(async {
        let (tx, mut rx) = unbounded_channel();
        tokio::spawn(read_commands(tx));
        run(args.servers, config, &mut rx).await
    });

    // Reading stdin blocks a runtime thread; exit without waiting for it.
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
