use netflow::{
    config::{Config, Mode},
    database::Database,
    export::Exporter,
    processor::Processor,
    stage::{Consolidate, Summarize},
};
use core::time::Duration;
use std::{
    net::{Ipv4Addr, TcpListener},
    sync::Arc,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

async fn serve(tcp: TcpListener, exporter: Arc<Exporter<Database>>) -> anyhow::Result<()> {
    let tcp = tokio::net::TcpListener::from_std(tcp)?;
    let http = hyper::server::conn::http1::Builder::new();
    let mut stop = core::pin::pin!(tokio::signal::ctrl_c());

    loop {
        let res = tokio::select! {
            accept_res = tcp.accept() => accept_res,
            stop_res = &mut stop => break stop_res?,
        };

        let (stream, other) = match res {
            Ok(pair) => pair,
            Err(err) => {
                log::error!("{err:?}");
                continue;
            }
        };

        log::info!("new connection from {other}");

        use core::convert::Infallible;
        use futures_util::FutureExt;
        let exporter = exporter.clone();
        let svc = hyper::service::service_fn(move |req| {
            netflow::router::handle(exporter.clone(), req).map(Ok::<_, Infallible>)
        });
        tokio::spawn(http.serve_connection(stream, svc));
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::from_env()?;
    let pg: tokio_postgres::Config = config.pg_url.parse()?;
    let tls = native_tls::TlsConnector::new()?;
    let tls = postgres_native_tls::MakeTlsConnector::new(tls);

    log::info!("starting in {:?} mode", config.mode);

    let rt = tokio::runtime::Builder::new_multi_thread().enable_io().enable_time().build()?;
    rt.block_on(async {
        let (client, conn) = pg.connect(tls).await?;
        let handle = rt.spawn(conn);

        let db = Arc::new(Database::from(client).with_visibility(config.visibility));
        db.migrate().await?;

        match config.mode {
            Mode::Summarize => {
                let handler = Summarize::new(db.clone(), config.output_bucket.as_str())
                    .delete_source(config.delete_source);
                let processor = Processor::new(db.clone(), db.clone(), Arc::new(handler), config.processor_config());
                processor.run(tokio::signal::ctrl_c()).await;
            }
            Mode::Consolidate => {
                let handler = Consolidate::new(db.clone(), config.output_bucket.as_str(), config.policy)
                    .delete_source(config.delete_source);
                let processor = Processor::new(db.clone(), db.clone(), Arc::new(handler), config.processor_config());
                processor.run(tokio::signal::ctrl_c()).await;
            }
            Mode::Compact => {
                let folded = netflow::stage::compact(&*db, &config.aggregate_bucket).await?;
                log::info!("compaction of {} done: {folded} shard(s)", config.aggregate_bucket);
            }
            Mode::Scan => {
                let sent = netflow::stage::announce(&*db, &*db, &config.source_bucket, &config.queue).await?;
                log::info!("announced {sent} object(s) of {} on {}", config.source_bucket, config.queue);
            }
            Mode::Export => {
                let tcp = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))?;
                tcp.set_nonblocking(true)?;
                log::info!("listening to {}", tcp.local_addr()?);

                let exporter = Exporter::new(db.clone(), config.aggregate_bucket.as_str());
                serve(tcp, Arc::new(exporter)).await?;
            }
        }

        // Open HTTP connections may still hold the client; they are abandoned after the grace period.
        drop(db);
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(res) => res??,
            Err(_) => log::warn!("database connection still in use; abandoning it"),
        }
        anyhow::Ok(())
    })?;

    log::warn!("stop signal received");
    Ok(())
}
