// usage: read-process-bytes <pid> <hex address> <size> [label]
extern crate env_logger;
extern crate secret_capture;

use secret_capture::*;
use std::env;
use std::process;

fn main() {
    env_logger::Builder::new()
        .filter_module("secret_capture", log::LevelFilter::Info)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .init();

    let args = env::args().collect::<Vec<_>>();
    if args.len() < 4 {
        eprintln!("usage: {} <pid> <hex address> <size> [label]", args[0]);
        process::exit(2);
    }
    let pid = args[1].parse::<Pid>().unwrap();
    let addr = usize::from_str_radix(args[2].trim_start_matches("0x"), 16).unwrap();
    let size = args[3].parse::<usize>().unwrap();
    let label = args.get(4).map(String::as_str).unwrap_or("Shared Secret");

    let target = Process::new(pid).unwrap();
    match copy_address_raw(addr, size, &target) {
        Ok(bytes) => println!("{}", OutputLine { label: label.to_string(), hex: hex::encode(&bytes) }),
        Err(e) => {
            eprintln!("Error: {:?}", e);
            process::exit(1);
        }
    }
}
