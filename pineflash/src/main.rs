use env_logger::Env;
use main_error::MainError;
use pineflash::{Config, Error, Flasher, SerialTransport};
use serial::BaudRate;
use std::{fs::read, path::PathBuf};
use structopt::StructOpt;

#[derive(StructOpt)]
struct Connection {
    /// Serial port
    #[structopt(short, long)]
    port: String,
    /// Baud rate, overrides the config file
    #[structopt(short, long)]
    baud_rate: Option<usize>,
    /// Path to a TOML file with session settings
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
    /// Enable debug logging
    #[structopt(short, long)]
    debug: bool,
}

#[derive(StructOpt)]
struct InfoOpt {
    #[structopt(flatten)]
    conn: Connection,
}

#[derive(StructOpt)]
struct LoadOpt {
    #[structopt(flatten)]
    conn: Connection,
    /// RAM image: boot header, segment header, then segment data
    #[structopt(parse(from_os_str))]
    image: PathBuf,
}

#[derive(StructOpt)]
enum Opt {
    /// Handshake and print boot info and flash id
    Info(InfoOpt),
    /// Load an image into RAM and run it
    Load(LoadOpt),
}

impl Opt {
    fn conn(&self) -> &Connection {
        match self {
            Opt::Info(opt) => &opt.conn,
            Opt::Load(opt) => &opt.conn,
        }
    }
}

impl Connection {
    fn config(&self) -> Result<Config, Error> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(baud_rate) = self.baud_rate {
            config.baud_rate = baud_rate;
        }
        Ok(config)
    }

    fn create_flasher(&self) -> Result<Flasher, Error> {
        let config = self.config()?;
        let serial = SerialTransport::open(&self.port, BaudRate::from_speed(config.baud_rate))?;
        Flasher::connect(serial, &config)
    }
}

fn info(opt: InfoOpt) -> Result<(), Error> {
    let flasher = opt.conn.create_flasher()?;
    let info = flasher.query();
    if let Some(boot_info) = info.boot_info {
        log::info!("Bootrom version: {}", boot_info.bootrom_version);
        log::trace!("Boot info: {:x?}", boot_info);
    }

    Ok(())
}

fn load(opt: LoadOpt) -> Result<(), Error> {
    let image = read(&opt.image)?;
    let flasher = opt.conn.create_flasher()?;
    flasher.query();
    flasher.load_image(&image)?;

    log::info!("Success");

    Ok(())
}

#[paw::main]
fn main(args: Opt) -> Result<(), MainError> {
    let filter = if args.conn().debug {
        "pineflash=debug"
    } else {
        "pineflash=info"
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(filter))
        .format_timestamp(None)
        .init();

    match args {
        Opt::Info(opt) => info(opt)?,
        Opt::Load(opt) => load(opt)?,
    };

    Ok(())
}
