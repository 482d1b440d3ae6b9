use futures_lite::future::block_on;
use std::{thread, time::Duration};
use thm1176::{usbtmc::Device, ConfigUpdate, FetchKind, Thm1176};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Optional TOML configuration, e.g. `block_size = 16`
    let update = match std::env::args().nth(1) {
        Some(path) => ConfigUpdate::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => ConfigUpdate::default(),
    };

    // Setup the device
    let d = block_on(Device::open_thm1176())?;
    println!("{d}");
    let mut probe = Thm1176::new(d);
    println!("{}", probe.identify()?);
    let report = probe.setup(update)?;
    for w in &report.warnings {
        eprintln!("warning: {w}");
    }

    // Acquire for a few seconds on a worker thread
    let handle = probe.handle();
    let worker = thread::spawn(move || probe.start());
    for _ in 0..5 {
        thread::sleep(Duration::from_secs(1));
        let (cycles, last) = handle.with_data(|data| {
            let last: Vec<f64> = FetchKind::AXES
                .iter()
                .filter_map(|&k| data.get(k).last().copied())
                .collect();
            (data.cycles(), last)
        });
        println!("{cycles} cycles, last field {last:?}");
    }
    handle.stop();
    let summary = worker.join().map_err(|_| "acquisition thread panicked")??;
    dbg!(summary);
    println!("errors: {:?}", handle.error_log());
    Ok(())
}
