use chat_client::{bind, config::Config, report, Client};
use protocol::{net, NodeAddress};
use rustyline::{error::ReadlineError, DefaultEditor};
use std::{error::Error, sync::Arc};
use toml_config::TomlConfig;

enum Command {
    Chat(String),
    Quit,
    Shutdown,
    Leader,
    Help,
}

fn help() {
    println!(
        r"---- Chat Client ----
Usage: chat-client [nickname] [leader host:port]
Anything not starting with / is sent to the chat.
Supported commands:
    /quit
    /shutdown
    /leader
    /help
"
    );
}

fn parse_command(line: &str) -> Result<Command, Box<dyn Error>> {
    if !line.starts_with('/') {
        return Ok(Command::Chat(line.to_owned()));
    }
    let command: Vec<&str> = line.split_ascii_whitespace().collect();
    Ok(match command.as_slice() {
        ["/quit" | "/exit" | "/q"] => Command::Quit,
        ["/shutdown"] => Command::Shutdown,
        ["/leader"] => Command::Leader,
        ["/help" | "/h"] => Command::Help,
        _ => return Err("Unsupported command, try /help".into()),
    })
}

fn main() -> Result<(), Box<dyn Error>> {
    let mut config = Config::load_first_toml_file(&["config.toml", "client/config.toml"])
        .unwrap_or_else(|e| {
            println!("Can't load config.toml, using defaults");
            println!("{e}");
            Config::default()
        });
    let mut args = std::env::args().skip(1);
    if let Some(nickname) = args.next() {
        config.nickname = nickname;
    }
    // A leader given as host:port is tried before broadcasting
    let leader: Option<NodeAddress> = args.next().map(|arg| arg.parse()).transpose()?;

    let (listener, group) = bind(&config)?;
    let host = config.host.clone().unwrap_or_else(net::local_ip);
    let local = NodeAddress::new(host, listener.local_addr()?.port());
    let client = Arc::new(Client::new(config, local));
    let threads = client.start(listener, group)?;
    if let Some(leader) = leader {
        client.set_leader(leader);
    }

    let leader = client.join()?;
    println!("Joined via {leader} as {}", client.nickname());
    help();

    let mut rl = DefaultEditor::new()?;
    while client.is_active() {
        let readline = rl.readline("> ");
        match readline {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let result = match parse_command(&line) {
                    Ok(Command::Chat(text)) => client.send_chat(&text),
                    Ok(Command::Quit) => {
                        client.quit().unwrap_or_else(|e| report(&e, "Leaving failed"));
                        break;
                    }
                    Ok(Command::Shutdown) => client.shutdown(),
                    Ok(Command::Leader) => {
                        match client.leader() {
                            Some(leader) => println!("Leader is {leader}"),
                            None => println!("No leader known"),
                        }
                        Ok(())
                    }
                    Ok(Command::Help) => {
                        help();
                        Ok(())
                    }
                    Err(e) => {
                        println!("{e}");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    report(&e, "Sending failed");
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                client.quit().unwrap_or_else(|e| report(&e, "Leaving failed"));
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                client.quit().unwrap_or_else(|e| report(&e, "Leaving failed"));
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }

    client.stop();
    for thread in threads {
        if thread.join().is_err() {
            println!("A listener thread panicked");
        }
    }
    Ok(())
}
