use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use secmem::protocol::{CODE_OK, RESPONSE_HEADER_LEN};
use secmem::transport;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroize;

#[derive(Parser, Debug)]
#[command(name = "secmemctl", about = "CLI for secmem-agent: put/get/delete/list/metrics over AF_UNIX")]
struct Args {
    #[arg(long, default_value = "/run/secmem.sock")]
    socket: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Store a secret: name=value, with a human-readable TTL like 10s/10m/1h.
    Put {
        item: String,
        #[arg(long, default_value = "0s")]
        ttl: String,
    },
    /// Fetch a secret by name and print it to stdout.
    Get { name: String },
    /// Delete a secret by name.
    Delete { name: String },
    /// List secret names visible to the caller.
    List,
    /// Print the agent's Prometheus metrics snapshot.
    Metrics,
}

const OP_PUT: u8 = 0;
const OP_GET: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_LIST: u8 = 3;
const OP_METRICS: u8 = 4;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.cmd {
        Cmd::Put { item, ttl } => put_cmd(&args.socket, &item, &ttl),
        Cmd::Get { name } => get_cmd(&args.socket, &name),
        Cmd::Delete { name } => delete_cmd(&args.socket, &name),
        Cmd::List => list_cmd(&args.socket),
        Cmd::Metrics => metrics_cmd(&args.socket),
    }
}

fn write_request(stream: &mut UnixStream, op: u8, name: &str, value: &[u8], ttl_secs: u32) -> Result<()> {
    let name_bytes = name.as_bytes();
    let mut header = [0u8; secmem::protocol::REQUEST_HEADER_LEN];
    header[0] = op;
    header[1..5].copy_from_slice(&(name_bytes.len() as u32).to_le_bytes());
    header[5..9].copy_from_slice(&(value.len() as u32).to_le_bytes());
    header[9..13].copy_from_slice(&ttl_secs.to_le_bytes());
    stream.write_all(&header)?;
    stream.write_all(name_bytes)?;
    stream.write_all(value)?;
    Ok(())
}

fn read_response_header(stream: &mut UnixStream) -> Result<(u32, u32)> {
    let mut buf = [0u8; RESPONSE_HEADER_LEN];
    stream.read_exact(&mut buf)?;
    let code = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let n = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    Ok((code, n))
}

fn put_cmd(socket: &str, item: &str, ttl: &str) -> Result<()> {
    let (name, value) = parse_item(item)?;
    let ttl_secs = humantime::parse_duration(ttl)?.as_secs().min(u32::MAX as u64) as u32;

    let mut stream = UnixStream::connect(socket)?;
    write_request(&mut stream, OP_PUT, &name, value.as_bytes(), ttl_secs)?;

    let (code, _n) = read_response_header(&mut stream)?;
    if code != CODE_OK {
        bail!("agent rejected PUT for '{name}'");
    }
    println!("OK");
    Ok(())
}

fn get_cmd(socket: &str, name: &str) -> Result<()> {
    let mut stream = UnixStream::connect(socket)?;
    write_request(&mut stream, OP_GET, name, &[], 0)?;

    let (code, _n) = read_response_header(&mut stream)?;
    if code != CODE_OK {
        bail!("no such secret: {name}");
    }

    let fd = transport::recv_fd(&stream)?.ok_or_else(|| anyhow!("agent did not send a descriptor"))?;
    let mut buf = transport::read_all_from_fd(fd)?;
    let out = String::from_utf8(buf.clone()).unwrap_or_else(|_| "<binary>".to_string());
    println!("{out}");
    buf.zeroize();
    Ok(())
}

fn delete_cmd(socket: &str, name: &str) -> Result<()> {
    let mut stream = UnixStream::connect(socket)?;
    write_request(&mut stream, OP_DELETE, name, &[], 0)?;
    let (code, _n) = read_response_header(&mut stream)?;
    if code != CODE_OK {
        bail!("no such secret: {name}");
    }
    println!("OK");
    Ok(())
}

fn list_cmd(socket: &str) -> Result<()> {
    let mut stream = UnixStream::connect(socket)?;
    write_request(&mut stream, OP_LIST, "", &[], 0)?;
    let (code, n) = read_response_header(&mut stream)?;
    if code != CODE_OK {
        bail!("LIST failed");
    }
    for _ in 0..n {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut name_buf = vec![0u8; len];
        stream.read_exact(&mut name_buf)?;
        println!("{}", String::from_utf8_lossy(&name_buf));
    }
    Ok(())
}

fn metrics_cmd(socket: &str) -> Result<()> {
    let mut stream = UnixStream::connect(socket)?;
    write_request(&mut stream, OP_METRICS, "", &[], 0)?;
    let (code, n) = read_response_header(&mut stream)?;
    if code != CODE_OK {
        bail!("METRICS failed");
    }
    let mut body = vec![0u8; n as usize];
    stream.read_exact(&mut body)?;
    print!("{}", String::from_utf8_lossy(&body));
    Ok(())
}

fn parse_item(item: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = item.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(anyhow!("item must be name=value"));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}
