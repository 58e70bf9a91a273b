use zio_log::Level;

#[test]
fn test_log() {
    tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .init();

    zio_log::debug!("debug");
    zio_log::error!("error");
    zio_log::event!(Level::DEBUG, "event");
    zio_log::info!("info");
    zio_log::warn!("warn");
    zio_log::trace!("trace");
}
