use fred::prelude::*;

#[tracing::instrument(skip(url), err)]
pub async fn connect(url: &str) -> anyhow::Result<fred::clients::Pool> {
    let config = fred::types::config::Config::from_url(url)?;
    let pool = fred::clients::Pool::new(config, None, None, None, 4)?;
    pool.init().await?;

    tracing::info!("connected to valkey");
    Ok(pool)
}

pub async fn set_with_ttl(
    pool: &fred::clients::Pool,
    key: &str,
    value: &str,
    ttl_secs: i64,
) -> Result<(), fred::error::Error> {
    pool.set::<(), _, _>(key, value, Some(Expiration::EX(ttl_secs)), None, false)
        .await
}

pub async fn get(
    pool: &fred::clients::Pool,
    key: &str,
) -> Result<Option<String>, fred::error::Error> {
    pool.get(key).await
}

pub async fn expire(
    pool: &fred::clients::Pool,
    key: &str,
    ttl_secs: i64,
) -> Result<(), fred::error::Error> {
    pool.expire::<(), _>(key, ttl_secs, None).await
}

pub async fn del(pool: &fred::clients::Pool, key: &str) -> Result<(), fred::error::Error> {
    pool.del::<(), _>(key).await
}

pub async fn publish(
    pool: &fred::clients::Pool,
    channel: &str,
    message: &str,
) -> Result<(), fred::error::Error> {
    pool.next().publish::<(), _, _>(channel, message).await
}
