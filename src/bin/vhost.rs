//! `vhost`, a host node: applications over the TCP stack, static routes.

use std::fs::File;
use std::io::{self, BufRead, Read, Write};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use log::error;
use structopt::StructOpt;

use vnet::config::NodeConfig;
use vnet::node::{Node, NodeKind};
use vnet::tcp::socket::ListenSocket;
use vnet::tcp::stack::TcpStack;
use vnet::types::{Endpoint, IpProtocol};

#[derive(StructOpt)]
#[structopt(name = "vhost", about = "Virtual network host node.")]
struct Opt {
    /// Path to the .lnx configuration file.
    #[structopt(long, parse(from_os_str))]
    config: PathBuf,
}

const HELP_TEXT: &str = "\
Available commands:
  exit
  help                         - Display this help message
  send <dest-ip> <message>     - Send a test message
  up <interface-name>          - Enable an interface
  down <interface-name>        - Disable an interface
  li                           - List interfaces
  ln                           - List neighbors
  lr                           - List routes
  a <port>                     - Listen + Accept connections
  c <ip> <port>                - Connect to a remote host
  s <sid> <payload>            - Send a payload via TCP socket
  r <sid> <max-bytes>          - Receive bytes via TCP socket
  sf <file-path> <addr> <port> - Send a file via TCP
  rf <dest-file> <port>        - Receive a file via TCP
  cl <sid>                     - Close a TCP socket
  ab <sid>                     - Abort a TCP socket
  ls                           - List TCP sockets
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
    let node = match Node::new(&config, NodeKind::Host) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    let stack = TcpStack::new();
    let ip_node = Arc::downgrade(&node);
    stack.register_ip_sender(Arc::new(move |dst, payload| {
        match ip_node.upgrade() {
            Some(node) => node.send_ip(dst, IpProtocol::Tcp, payload).map(|_| ()),
            None => Ok(()),
        }
    }));
    node.attach_tcp(Arc::clone(&stack));
    stack.start();
    node.start();

    repl(&node, &stack);

    stack.stop();
    node.shutdown();
}

fn repl(node: &Arc<Node>, stack: &Arc<TcpStack>) {
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
            "a" => cmd_accept(stack, &args),
            "c" => cmd_connect(node, stack, &args),
            "s" => cmd_socket_send(stack, line, &args),
            "r" => cmd_socket_recv(stack, &args),
            "sf" => cmd_send_file(node, stack, &args),
            "rf" => cmd_recv_file(stack, &args),
            "cl" => cmd_close(stack, &args),
            "ab" => cmd_abort(stack, &args),
            "ls" => {
                let _ = stack.list_sockets(&mut stdout);
            }
            other => println!("ERROR: Unknown command {other:?}. Try `help`."),
        }
    }
}

fn parse_sid(args: &[&str]) -> Option<u32> {
    args.first()?.parse().ok()
}

fn cmd_send(node: &Arc<Node>, line: &str, args: &[&str]) {
    let Some(dest) = args.first().and_then(|a| a.parse::<Ipv4Addr>().ok()) else {
        println!("ERROR: Command `send` is missing destination IP address.");
        return;
    };
    // The message is everything after the address, whitespace included.
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

fn cmd_accept(stack: &Arc<TcpStack>, args: &[&str]) {
    let Some(port) = args.first().and_then(|a| a.parse::<u16>().ok()) else {
        println!("ERROR: Command `a` is missing port.");
        return;
    };
    let listener = match stack.listen(port) {
        Ok(listener) => listener,
        Err(e) => {
            println!("ERROR: Failed to listen on port {port} ({e})");
            return;
        }
    };
    println!("Listening on port {port} (SID = {})", listener.id);

    // Accept forever in the background; each new connection is announced.
    thread::spawn(move || loop {
        match listener.accept() {
            Ok(conn) => println!("New connection on socket {} from {}", conn.id, conn.tuple.remote),
            Err(e) => {
                println!("Accept on socket {} stopped ({e})", listener.id);
                break;
            }
        }
    });
}

fn cmd_connect(node: &Arc<Node>, stack: &Arc<TcpStack>, args: &[&str]) {
    let (Some(addr), Some(port)) = (
        args.first().and_then(|a| a.parse::<Ipv4Addr>().ok()),
        args.get(1).and_then(|a| a.parse::<u16>().ok()),
    ) else {
        println!("ERROR: Command `c` expects <ip> <port>.");
        return;
    };
    let local = match node.source_addr_for(addr) {
        Ok(local) => local,
        Err(e) => {
            println!("ERROR: {e}");
            return;
        }
    };
    match stack.connect(local, Endpoint::new(addr, port)) {
        Ok(conn) => println!("Connected (SID = {})", conn.id),
        Err(e) => println!("ERROR: connect failed ({e})"),
    }
}

fn cmd_socket_send(stack: &Arc<TcpStack>, line: &str, args: &[&str]) {
    let Some(sid) = parse_sid(args) else {
        println!("ERROR: Command `s` expects <sid> <payload>.");
        return;
    };
    let Some(start) = line.find(args[0]).map(|p| p + args[0].len() + 1) else {
        println!("ERROR: Command `s` is missing payload.");
        return;
    };
    if start > line.len() {
        println!("ERROR: Command `s` is missing payload.");
        return;
    }
    let payload = &line[start..];
    match stack.send(sid, payload.as_bytes()) {
        Ok(n) => println!("Sent {n} bytes"),
        Err(e) => println!("ERROR: send failed ({e})"),
    }
}

fn cmd_socket_recv(stack: &Arc<TcpStack>, args: &[&str]) {
    let (Some(sid), Some(max)) = (
        parse_sid(args),
        args.get(1).and_then(|a| a.parse::<usize>().ok()),
    ) else {
        println!("ERROR: Command `r` expects <sid> <max-bytes>.");
        return;
    };
    let mut buf = vec![0u8; max];
    match stack.recv(sid, &mut buf, max) {
        Ok(n) => println!("Read {n} bytes: {}", String::from_utf8_lossy(&buf[..n])),
        Err(e) => println!("ERROR: recv failed ({e})"),
    }
}

fn cmd_send_file(node: &Arc<Node>, stack: &Arc<TcpStack>, args: &[&str]) {
    let (Some(path), Some(addr), Some(port)) = (
        args.first().map(PathBuf::from),
        args.get(1).and_then(|a| a.parse::<Ipv4Addr>().ok()),
        args.get(2).and_then(|a| a.parse::<u16>().ok()),
    ) else {
        println!("ERROR: Command `sf` expects <file-path> <addr> <port>.");
        return;
    };
    let local = match node.source_addr_for(addr) {
        Ok(local) => local,
        Err(e) => {
            println!("ERROR: {e}");
            return;
        }
    };
    let stack = Arc::clone(stack);
    thread::spawn(move || {
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                println!("ERROR: cannot open {}: {e}", path.display());
                return;
            }
        };
        let conn = match stack.connect(local, Endpoint::new(addr, port)) {
            Ok(conn) => conn,
            Err(e) => {
                println!("ERROR: connect failed ({e})");
                return;
            }
        };

        let mut total = 0usize;
        let mut buf = [0u8; 8192];
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    error!("sf: read error: {e}");
                    break;
                }
            };
            match conn.write(&buf[..n]) {
                Ok(written) => total += written,
                Err(e) => {
                    println!("ERROR: send failed after {total} bytes ({e})");
                    return;
                }
            }
        }
        let _ = conn.close();
        println!("Sent {total} bytes from {}", path.display());
    });
}

fn cmd_recv_file(stack: &Arc<TcpStack>, args: &[&str]) {
    let (Some(path), Some(port)) = (
        args.first().map(PathBuf::from),
        args.get(1).and_then(|a| a.parse::<u16>().ok()),
    ) else {
        println!("ERROR: Command `rf` expects <dest-file> <port>.");
        return;
    };
    let listener = match stack.listen(port) {
        Ok(listener) => listener,
        Err(e) => {
            println!("ERROR: Failed to listen on port {port} ({e})");
            return;
        }
    };
    let stack = Arc::clone(stack);
    thread::spawn(move || {
        let conn = match listener.accept() {
            Ok(conn) => conn,
            Err(e) => {
                println!("ERROR: accept failed ({e})");
                return;
            }
        };
        let mut file = match File::create(&path) {
            Ok(file) => file,
            Err(e) => {
                println!("ERROR: cannot create {}: {e}", path.display());
                return;
            }
        };

        let mut total = 0usize;
        let mut buf = [0u8; 8192];
        let buf_len = buf.len();
        loop {
            match conn.read(&mut buf, buf_len) {
                Ok(n) => {
                    if file.write_all(&buf[..n]).is_err() {
                        println!("ERROR: write to {} failed", path.display());
                        break;
                    }
                    total += n;
                }
                Err(_) => break, // peer closed and the buffer drained
            }
        }
        let _ = conn.close();
        close_listener(&stack, &listener);
        println!("Received {total} bytes into {}", path.display());
    });
}

fn close_listener(stack: &Arc<TcpStack>, listener: &Arc<ListenSocket>) {
    let _ = stack.close(listener.id);
}

fn cmd_close(stack: &Arc<TcpStack>, args: &[&str]) {
    let Some(sid) = parse_sid(args) else {
        println!("ERROR: Command `cl` expects <sid>.");
        return;
    };
    match stack.close(sid) {
        Ok(()) => println!("Socket {sid} closed"),
        Err(e) => println!("ERROR: close failed ({e})"),
    }
}

fn cmd_abort(stack: &Arc<TcpStack>, args: &[&str]) {
    let Some(sid) = parse_sid(args) else {
        println!("ERROR: Command `ab` expects <sid>.");
        return;
    };
    match stack.abort(sid) {
        Ok(()) => println!("Socket {sid} aborted"),
        Err(e) => println!("ERROR: abort failed ({e})"),
    }
}
