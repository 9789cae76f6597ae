//! File utilities over the SMB shim

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_smbw::credentials::StaticCredentials;
use rust_smbw::{Dispatcher, Errno, LocalNetwork, ShimConfig};
use std::sync::Arc;
use std::time::Duration;

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "smbw")]
#[command(about = "File utilities for paths under a virtual SMB namespace", long_about = None)]
struct Args {
    /// Export a local directory as a share (SERVER/SHARE=DIR), repeatable
    #[arg(short = 'e', long = "export")]
    exports: Vec<String>,

    /// Namespace prefix
    #[arg(long, default_value = "/smb/")]
    prefix: String,

    /// Default workgroup
    #[arg(short = 'w', long, default_value = "WORKGROUP")]
    workgroup: String,

    /// Username for authentication
    #[arg(short = 'u', long, default_value = "guest")]
    username: String,

    /// Password for authentication
    #[arg(short = 'P', long, default_value = "")]
    password: String,

    /// Per-operation timeout in seconds
    #[arg(short = 't', long, default_value = "30")]
    timeout: u64,

    /// Log level
    #[arg(short = 'l', long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List a directory
    Ls {
        #[arg(default_value = "/smb/")]
        path: String,
    },

    /// Print a file to stdout
    Cat { path: String },

    /// Copy a local file into the namespace
    Put { local: String, remote: String },

    /// Copy between any two paths
    Cp { from: String, to: String },

    /// Display file information
    Stat { path: String },

    /// Create a directory
    Mkdir { path: String },

    /// Remove a file (or cancel a print job)
    Rm { path: String },

    /// Remove an empty directory
    Rmdir { path: String },

    /// Rename a file or directory
    Mv { from: String, to: String },
}

fn context(path: &str) -> impl Fn(Errno) -> String + '_ {
    move |e| format!("{}: {}", path, e.desc())
}

fn copy(d: &mut Dispatcher, from: &str, to: &str) -> Result<u64, String> {
    let src = d.open(from, libc::O_RDONLY, 0).map_err(context(from))?;
    let dst = match d.open(to, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, 0o644) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = d.close(src);
            return Err(context(to)(e));
        }
    };
    let result = pump(d, src, dst).map_err(|(path_is_src, e)| {
        context(if path_is_src { from } else { to })(e)
    });
    d.close(src).map_err(context(from))?;
    d.close(dst).map_err(context(to))?;
    result
}

/// Copy until EOF; the error flag says whether the source failed
fn pump(d: &mut Dispatcher, src: i32, dst: i32) -> Result<u64, (bool, Errno)> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = d.read(src, &mut buf).map_err(|e| (true, e))?;
        if n == 0 {
            return Ok(total);
        }
        let mut written = 0;
        while written < n {
            written += d.write(dst, &buf[written..n]).map_err(|e| (false, e))?;
        }
        total += n as u64;
    }
}

fn list(d: &mut Dispatcher, path: &str) -> Result<(), String> {
    let fd = d.opendir(path).map_err(context(path))?;
    let mut names = Vec::new();
    loop {
        let batch = d.getdents(fd, 64).map_err(context(path))?;
        if batch.is_empty() {
            break;
        }
        names.extend(
            batch
                .into_iter()
                .map(|r| r.name)
                .filter(|n| n != "." && n != ".."),
        );
    }
    d.closedir(fd).map_err(context(path))?;

    for name in names {
        let child = format!("{}/{}", path.trim_end_matches('/'), name.replace('#', "##"));
        match d.stat(&child) {
            Ok(st) => {
                let kind = if st.is_dir() { 'd' } else { '-' };
                println!("{}{:o} {:>12} {}", kind, st.mode & 0o777, st.size, name);
            }
            Err(e) => println!("?          {:>12} {} ({})", "", name, e.desc()),
        }
    }
    Ok(())
}

fn show_stat(d: &mut Dispatcher, path: &str) -> Result<(), String> {
    let st = d.stat(path).map_err(context(path))?;
    let time = |secs: i64| {
        DateTime::<Utc>::from_timestamp(secs, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| secs.to_string())
    };
    println!("  File: {}", path);
    println!(
        "  Size: {:<12} Type: {}",
        st.size,
        if st.is_dir() { "directory" } else { "regular file" }
    );
    println!("Device: {:<12x} Inode: {:x}", st.dev, st.ino);
    println!("  Mode: {:o}", st.mode);
    println!("Access: {}", time(st.atime));
    println!("Modify: {}", time(st.mtime));
    println!("Change: {}", time(st.ctime));
    Ok(())
}

fn run(d: &mut Dispatcher, command: Commands) -> Result<(), String> {
    match command {
        Commands::Ls { path } => list(d, &path),
        Commands::Cat { path } => {
            let fd = d.open(&path, libc::O_RDONLY, 0).map_err(context(&path))?;
            let mut buf = vec![0u8; COPY_CHUNK];
            let mut out = Vec::new();
            loop {
                let n = d.read(fd, &mut buf).map_err(context(&path))?;
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            d.close(fd).map_err(context(&path))?;
            print!("{}", String::from_utf8_lossy(&out));
            Ok(())
        }
        Commands::Put { local, remote } | Commands::Cp {
            from: local,
            to: remote,
        } => {
            let n = copy(d, &local, &remote)?;
            tracing::info!("Copied {} bytes from {} to {}", n, local, remote);
            Ok(())
        }
        Commands::Stat { path } => show_stat(d, &path),
        Commands::Mkdir { path } => d.mkdir(&path, 0o755).map_err(context(&path)),
        Commands::Rm { path } => d.unlink(&path).map_err(context(&path)),
        Commands::Rmdir { path } => d.rmdir(&path).map_err(context(&path)),
        Commands::Mv { from, to } => d.rename(&from, &to).map_err(context(&from)),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut network = LocalNetwork::new(&args.workgroup);
    for export in &args.exports {
        network.add_export(export)?;
    }

    let config = ShimConfig {
        prefix: args.prefix.clone(),
        workgroup: args.workgroup.clone(),
        username: args.username.clone(),
        password: args.password.clone(),
        op_timeout: Duration::from_secs(args.timeout),
        ..Default::default()
    };
    let credentials = Arc::new(StaticCredentials::new(&args.username, &args.password));
    let mut dispatcher = Dispatcher::new(config, Arc::new(network))?.with_credentials(credentials);

    let result = run(&mut dispatcher, args.command);
    dispatcher.shutdown();
    result.map_err(|e| e.into())
}
