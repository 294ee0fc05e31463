//! `vrouter`, a router node: IPv4 forwarding plus the RIP engine.

use std::io::{self, BufRead, Write};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use structopt::StructOpt;

use vnet::config::NodeConfig;
use vnet::ip::rip::RipEngine;
use vnet::node::{Node, NodeKind};

#[derive(StructOpt)]
#[structopt(name = "vrouter", about = "Virtual network router node.")]
struct Opt {
    /// Path to the .lnx configuration file.
    #[structopt(long, parse(from_os_str))]
    config: PathBuf,
}

const HELP_TEXT: &str = "\
Available commands:
  exit
  help                      - Display this help message
  send <dest-ip> <message>  - Send a test message
  up <interface-name>       - Enable an interface
  down <interface-name>     - Disable an interface
  li                        - List interfaces
  ln                        - List neighbors
  lr                        - List routes
";

fn main() {
    env_logger::init();
    let opt = Opt::from_args();

    let config = match NodeConfig::load(&opt.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let node = match Node::new(&config, NodeKind::Router) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    let engine = RipEngine::start(&node, config.rip_neighbors.clone());
    node.attach_rip(engine);
    node.start();

    repl(&node);

    node.shutdown();
}

fn repl(node: &Arc<Node>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(_) => break,
        }
        let line = line.trim();
        if line == "exit" {
            break;
        }
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let command = fields.next().unwrap_or("");
        let args: Vec<&str> = fields.collect();

        match command {
            "help" => print!("{HELP_TEXT}"),
            "send" => cmd_send(node, line, &args),
            "up" => cmd_toggle(node, &args, true),
            "down" => cmd_toggle(node, &args, false),
            "li" => {
                let _ = node.list_interfaces(&mut stdout);
            }
            "ln" => {
                let _ = node.list_neighbors(&mut stdout);
            }
            "lr" => {
                let _ = node.list_routes(&mut stdout);
            }
            other => println!("ERROR: Unknown command {other:?}. Try `help`."),
        }
    }
}

fn cmd_send(node: &Arc<Node>, line: &str, args: &[&str]) {
    let Some(dest) = args.first().and_then(|a| a.parse::<Ipv4Addr>().ok()) else {
        println!("ERROR: Command `send` is missing destination IP address.");
        return;
    };
    let Some(start) = line.find(args[0]).map(|p| p + args[0].len() + 1) else {
        println!("ERROR: Command `send` is missing message.");
        return;
    };
    if start > line.len() {
        println!("ERROR: Command `send` is missing message.");
        return;
    }
    let message = &line[start..];
    match node.send_test(dest, message) {
        Ok(_) => println!("Sent test message \"{message}\" to {dest}"),
        Err(e) => println!("ERROR: {e}"),
    }
}

fn cmd_toggle(node: &Arc<Node>, args: &[&str], up: bool) {
    let Some(name) = args.first() else {
        println!("ERROR: Missing interface name.");
        return;
    };
    if up {
        node.enable_interface(name);
    } else {
        node.disable_interface(name);
    }
}
