use std::sync::Arc;

use mdx_data::*;

const SAMPLE: &str = "pSymbol,pExchSeg,pTrdSymbol,pOptionType,dStrikePrice;,lLotSize\n\
    26000,nse_cm,NIFTY,,-1,1\n\
    26009,nse_cm,NIFTYBANK,,-1,1\n\
    35001,nse_fo,NIFTY24DEC24000CE,CE,2400000.000000,75\n\
    2885,nse_cm,RELIANCE-EQ,,-1,1\n";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Master data basic usage example");

    // A directory of master CSVs stands in for the remote catalog
    let workdir = tempfile::tempdir()?;
    let source_dir = workdir.path().join("masters");
    std::fs::create_dir_all(&source_dir)?;
    std::fs::write(source_dir.join("nse_cm.csv"), SAMPLE)?;

    let config = MasterDataConfig {
        source: SourceConfig::local(&source_dir),
        store: StoreConfig {
            backend: StoreBackend::Json,
            path: workdir.path().join("master_index.json"),
        },
        ..Default::default()
    };

    let service = Arc::new(MasterDataService::from_config(config)?);
    println!("Initial status: {}", service.status().state);

    let index = service.ensure_loaded().await?;
    println!("Indexed {} symbols (built {})", index.len(), index.built_at());

    for record in service.search("nif", 5) {
        println!("  {}", record);
    }

    if let Some(option) = service.get("nifty24dec24000ce") {
        println!("Lot size of {}: {}", option.symbol, option.lot_size);
    }

    let status = service.status();
    println!("Status: {}", serde_json::to_string_pretty(&status)?);

    println!("Example completed successfully!");
    Ok(())
}
