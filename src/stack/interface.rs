use crate::config::StackConfig;
use crate::device::TunDevice;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, Ipv4Address};

/// Register the virtual interface with the engine and pre-build the socket
/// pool that backs intercepted flows. `set_any_ip` is what lets a pooled
/// listener claim a SYN for any destination address.
pub(super) fn build_interface(
    config: &StackConfig,
    device: &mut TunDevice,
) -> (Interface, SocketSet<'static>, Vec<SocketHandle>) {
    let ipv4 = Ipv4Address::from_bytes(&config.ipv4.ip_address.octets());
    let prefix = config.ipv4.prefix_len();

    let mut iface_config = IfaceConfig::new(HardwareAddress::Ip);
    iface_config.random_seed = 0;
    let mut interface = Interface::new(iface_config, device, Instant::from_millis(0));
    interface.set_any_ip(true);
    interface.update_ip_addrs(|ip_addrs| {
        ip_addrs.clear();
        let _ = ip_addrs.push(IpCidr::new(IpAddress::Ipv4(ipv4), prefix));
    });
    // `any_ip` treats a destination as locally routed only when the default
    // route's gateway is one of our own addresses (smoltcp routes `lookup`);
    // route through ourselves so every destination is claimable, matching
    // the teacher's `flow_manager/interface.rs`.
    interface.routes_mut().add_default_ipv4_route(ipv4).ok();

    let mut sockets = SocketSet::new(Vec::new());
    let mut pool = Vec::with_capacity(config.socket_pool_size);
    for _ in 0..config.socket_pool_size {
        let socket = TcpSocket::new(
            TcpSocketBuffer::new(vec![0; config.tcp_rx_buffer_size]),
            TcpSocketBuffer::new(vec![0; config.tcp_tx_buffer_size]),
        );
        pool.push(sockets.add(socket));
    }

    (interface, sockets, pool)
}
