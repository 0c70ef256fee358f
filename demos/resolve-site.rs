// usage: resolve-site <pid> <library> <export | +hex offset>
//
// With no locator, resolves the built-in SmartGlass preset for this platform.
extern crate env_logger;
extern crate secret_capture;

use secret_capture::*;
use std::env;
use std::process;

fn descriptor(library: &str, locator: &str) -> SiteDescriptor {
    match locator.strip_prefix('+') {
        Some(offset) => {
            let offset = u64::from_str_radix(offset.trim_start_matches("0x"), 16).unwrap();
            SiteDescriptor::offset(library, offset)
        }
        None => SiteDescriptor::export(library, locator),
    }
}

fn main() {
    env_logger::Builder::new()
        .filter_module("secret_capture", log::LevelFilter::Debug)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();

    let args = env::args().collect::<Vec<_>>();
    let site = match args.len() {
        2 if cfg!(windows) => CaptureConfig::smartglass_windows().site,
        2 => CaptureConfig::smartglass_android().site,
        4 => descriptor(&args[2], &args[3]),
        _ => {
            eprintln!("usage: {} <pid> [<library> <export | +hex offset>]", args[0]);
            process::exit(2);
        }
    };
    let pid = args[1].parse::<Pid>().unwrap();

    match resolve(&ProcessModules::new(pid), &site) {
        Ok(site) => println!("{} = {:#x}", site.descriptor, site.address),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
