//! Direct TCP probing of addresses, for networks where broadcast does not
//! reach the devices.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use futures::{StreamExt, stream};
use log::{debug, info};

use crate::codec::{self, CommandType, DataPointMap, FrameDecoder};
use crate::device::{DEFAULT_PORT, DeviceDescriptor};
use crate::errors::Error;
use crate::runtime::{self, AsyncTcpStream, TcpStream};

type Result<T> = std::result::Result<T, Error>;

const READ_BUFFER_SIZE: usize = 1024;

/// Connect to one address, send INFO and describe whatever answers.
///
/// `within` bounds the whole exchange, connect included.
pub async fn probe(ip: Ipv4Addr, port: u16, within: Duration) -> Result<DeviceDescriptor> {
    runtime::timeout(within, exchange(ip, port))
        .await
        .map_err(|_| {
            Error::socket(
                "probe",
                std::io::Error::new(std::io::ErrorKind::TimedOut, "no INFO reply"),
            )
        })?
        .map(|descriptor| descriptor.with_port(port))
}

async fn exchange(ip: Ipv4Addr, port: u16) -> Result<DeviceDescriptor> {
    let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::connect_failure(addr, e))?;
    let request = codec::encode(CommandType::Info, &DataPointMap::new())?;
    stream
        .write_all(&request)
        .await
        .map_err(|e| Error::socket("write", e))?;

    let mut decoder = FrameDecoder::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        let n = stream
            .read(&mut buffer)
            .await
            .map_err(|e| Error::socket("read", e))?;
        if n == 0 {
            return Err(Error::SocketClosed(addr));
        }
        decoder.extend(&buffer[..n]);
        while let Some(result) = decoder.next_frame() {
            match result {
                Ok(frame) => {
                    if let Some(info) = frame.info {
                        return Ok(DeviceDescriptor::from_info(&info, ip));
                    }
                }
                Err(e) => debug!("{addr}: {e}"),
            }
        }
    }
}

/// Probe every address on the default port, `concurrency` at a time.
pub async fn scan(
    ips: Vec<Ipv4Addr>,
    concurrency: usize,
    within: Duration,
) -> Vec<DeviceDescriptor> {
    scan_port(ips, DEFAULT_PORT, concurrency, within).await
}

/// Like [`scan`] with an explicit port. Results are ordered by address.
pub async fn scan_port(
    ips: Vec<Ipv4Addr>,
    port: u16,
    concurrency: usize,
    within: Duration,
) -> Vec<DeviceDescriptor> {
    let total = ips.len();
    let mut found: Vec<DeviceDescriptor> = stream::iter(ips)
        .map(|ip| async move {
            match probe(ip, port, within).await {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    debug!("{ip}: {e}");
                    None
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|result| async move { result })
        .collect()
        .await;

    found.sort_by_key(DeviceDescriptor::ip);
    info!("Scanned {total} addresses, found {} devices", found.len());
    found
}

/// Most addresses one target may expand to, a /16.
pub const MAX_TARGETS: u64 = 1 << 16;

/// Expand a target into addresses.
///
/// Accepts a single address, an inclusive range `a.b.c.d-e.f.g.h`, or CIDR
/// notation. CIDR blocks larger than two addresses skip the network and
/// broadcast addresses. Targets covering more than [`MAX_TARGETS`]
/// addresses are rejected.
///
/// # Examples
///
/// ```
/// use cozylife_local::scan::expand_targets;
///
/// assert_eq!(expand_targets("192.168.1.0/30").unwrap().len(), 2);
/// assert_eq!(expand_targets("10.0.0.254-10.0.1.1").unwrap().len(), 4);
/// assert!(expand_targets("10.0.0.9-10.0.0.1").is_err());
/// assert!(expand_targets("0.0.0.0/0").is_err());
/// ```
pub fn expand_targets(target: &str) -> Result<Vec<Ipv4Addr>> {
    let invalid = |reason: &str| Error::InvalidTarget(format!("{target:?}: {reason}"));
    let parse = |s: &str| s.trim().parse::<Ipv4Addr>().map_err(|e| invalid(&e.to_string()));

    if let Some((network, prefix)) = target.split_once('/') {
        let prefix: u32 = prefix.trim().parse().map_err(|_| invalid("bad prefix"))?;
        if prefix > 32 {
            return Err(invalid("prefix above 32"));
        }
        let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
        let first = u32::from(parse(network)?) & mask;
        let last = first | !mask;
        let (first, last) = if last - first >= 2 {
            (first + 1, last - 1)
        } else {
            (first, last)
        };
        return bounded(first, last).map_err(|reason| invalid(&reason));
    }

    if let Some((start, end)) = target.split_once('-') {
        let (start, end) = (u32::from(parse(start)?), u32::from(parse(end)?));
        if start > end {
            return Err(invalid("range start is after its end"));
        }
        return bounded(start, end).map_err(|reason| invalid(&reason));
    }

    Ok(vec![parse(target)?])
}

fn bounded(first: u32, last: u32) -> std::result::Result<Vec<Ipv4Addr>, String> {
    let count = u64::from(last - first) + 1;
    if count > MAX_TARGETS {
        return Err(format!("{count} addresses, at most {MAX_TARGETS} allowed"));
    }
    Ok((first..=last).map(Ipv4Addr::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_targets() {
        assert_eq!(
            expand_targets("192.168.1.57").unwrap(),
            vec![Ipv4Addr::new(192, 168, 1, 57)]
        );
        let block = expand_targets("192.168.1.77/24").unwrap();
        assert_eq!(block.len(), 254);
        assert_eq!(block[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(expand_targets("10.1.2.3/32").unwrap().len(), 1);
        assert!(expand_targets("10.1.2.3/33").is_err());
        assert!(expand_targets("nope").is_err());
    }

    #[test]
    fn test_expand_targets_is_bounded() {
        assert_eq!(expand_targets("10.0.0.0/16").unwrap().len(), 65534);
        assert!(matches!(expand_targets("0.0.0.0/0"), Err(Error::InvalidTarget(_))));
        assert!(expand_targets("10.0.0.0/15").is_err());
        assert!(expand_targets("0.0.0.0-255.255.255.255").is_err());
        assert_eq!(expand_targets("10.0.0.0-10.0.255.255").unwrap().len(), 65536);
    }

    #[cfg(feature = "runtime-tokio")]
    mod live {
        use super::*;
        use crate::device::DeviceType;
        use crate::testing::{FakeDevice, refused_descriptor};

        #[tokio::test]
        async fn test_probe_reads_info() {
            let device = FakeDevice::bind().await;
            let answer = async {
                let mut conn = device.accept().await;
                conn.expect_command(0).await;
                conn.push(serde_json::json!({"1": 0})).await;
                conn.send_info("629168597cb94c4c1d8f", "01").await;
                conn
            };
            let (found, _conn) = tokio::join!(
                probe(Ipv4Addr::LOCALHOST, device.port(), Duration::from_secs(5)),
                answer
            );
            let found = found.unwrap();
            assert_eq!(found.serial(), "629168597cb94c4c1d8f");
            assert_eq!(found.device_type(), Some(&DeviceType::Light));
            assert_eq!(found.port(), device.port());
        }

        #[tokio::test]
        async fn test_probe_failures() {
            let refused = refused_descriptor("x");
            assert!(matches!(
                probe(Ipv4Addr::LOCALHOST, refused.port(), Duration::from_secs(5)).await,
                Err(Error::ConnectFailure { .. })
            ));

            // Accepts but never answers.
            let silent = FakeDevice::bind().await;
            let (result, _conn) = tokio::join!(
                probe(Ipv4Addr::LOCALHOST, silent.port(), Duration::from_millis(300)),
                silent.accept()
            );
            assert!(matches!(result, Err(Error::Socket { .. })));
        }

        #[tokio::test]
        async fn test_scan_skips_silent_addresses() {
            let refused = refused_descriptor("x");
            let found = scan_port(
                vec![Ipv4Addr::LOCALHOST],
                refused.port(),
                4,
                Duration::from_secs(1),
            )
            .await;
            assert!(found.is_empty());
        }
    }
}
