use dbroker::BrokerConfig;
use dbroker::server::storage_dir_for;

pub fn run(config: &BrokerConfig, url: &str, format: &str) -> anyhow::Result<()> {
    let rewritten = config.url.rewrite(url)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&rewritten)?);
        return Ok(());
    }

    let Some(rewritten) = rewritten else {
        println!("not a broker url (expected prefix '{}')", config.url.broker_prefix);
        return Ok(());
    };

    println!("engine url: {}", rewritten.engine_url);
    match rewritten.target {
        Some(target) => {
            println!("port:       {}", target.port);
            println!("database:   {}", target.database);
            println!(
                "storage:    {}",
                storage_dir_for(&config.base_dir, target.port).display()
            );
        }
        None => println!("unmanaged:  no server is started for this url"),
    }
    Ok(())
}
