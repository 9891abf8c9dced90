use protocol::{net, NodeAddress};
use server_node::{config::Config, transport::NetTransport, Server, Sockets};
use std::{error::Error, sync::Arc};
use toml_config::TomlConfig;

fn main() -> Result<(), Box<dyn Error>> {
    let config = Config::load_first_toml_file(&["config.toml", "server-node/config.toml"])?;
    dbg!(&config);

    let sockets = Sockets::bind(&config)?;
    let host = config.host.clone().unwrap_or_else(net::local_ip);
    let local = NodeAddress::new(host, sockets.unicast_port()?);
    let transport = NetTransport::new(&config)?;

    let server = Arc::new(Server::new(config, local, transport));
    server.start(sockets)?;

    Ok(())
}
