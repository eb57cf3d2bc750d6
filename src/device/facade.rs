//! The stream device facade.
//!
//! Owns the transport context, the block registry, and the converter
//! registry, and builds streamers on request. Construction is serialized
//! by a setup mutex; the data paths of finished streamers run without it.
//! The facade keeps only weak references to streamers, keyed by terminator
//! id, so rate updates can reach live streamers without extending their
//! lifetime. Expired entries are pruned lazily on every map access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info};

use crate::block::BlockPort;
use crate::chdr::{wire_format, Endianness, MAX_HEADER_WORDS, WORD_SIZE};
use crate::convert::{Converter, ConverterId, ConverterRegistry};
use crate::device::context::DeviceTransportContext;
use crate::device::factory::{Transport, TransportKind, TransportProvider};
use crate::device::StreamArgs;
use crate::error::{Error, Result};
use crate::flow::window::{
    rx_fc_interval_bytes, rx_window_packets, tx_window_bytes, DEFAULT_RX_FC_REQUEST_FREQ,
    DEFAULT_TX_FC_RESPONSE_FREQ,
};
use crate::flow::{RxFlowState, TxFlowState};
use crate::stream::async_msg::{AsyncMsg, AsyncMsgQueue};
use crate::stream::rx::{RxChannel, RxStreamer};
use crate::stream::terminator::{Direction, StreamTerminator};
use crate::stream::tx::{TxChannel, TxStreamer};

pub struct StreamDevice {
    context: DeviceTransportContext,
    provider: Arc<dyn TransportProvider>,
    endianness: Endianness,
    blocks: Mutex<Vec<Arc<dyn BlockPort>>>,
    converters: ConverterRegistry,
    /// Serializes streamer construction.
    setup_lock: Mutex<()>,
    rx_streamers: Mutex<HashMap<String, Weak<RxStreamer>>>,
    tx_streamers: Mutex<HashMap<String, Weak<TxStreamer>>>,
    legacy_async: Arc<AsyncMsgQueue>,
}

/// Per-channel construction state shared by the rx/tx paths.
struct ChannelSetup {
    block: Arc<dyn BlockPort>,
    port: usize,
    transport: Transport,
}

impl StreamDevice {
    pub fn new(
        provider: Arc<dyn TransportProvider>,
        endianness: Endianness,
        num_devices: usize,
    ) -> Self {
        Self {
            context: DeviceTransportContext::new(num_devices),
            provider,
            endianness,
            blocks: Mutex::new(Vec::new()),
            converters: ConverterRegistry::new(),
            setup_lock: Mutex::new(()),
            rx_streamers: Mutex::new(HashMap::new()),
            tx_streamers: Mutex::new(HashMap::new()),
            legacy_async: Arc::new(AsyncMsgQueue::default()),
        }
    }

    /// Register a block controller; returns its index for `ChannelSpec`.
    pub fn register_block(&self, block: Arc<dyn BlockPort>) -> usize {
        let mut blocks = self.blocks.lock().expect("block registry poisoned");
        blocks.push(block);
        blocks.len() - 1
    }

    pub fn converters(&self) -> &ConverterRegistry {
        &self.converters
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    fn block(&self, index: usize) -> Result<Arc<dyn BlockPort>> {
        self.blocks
            .lock()
            .expect("block registry poisoned")
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Value(format!("no block registered at index {index}")))
    }

    fn resolve_converter(&self, args: &StreamArgs) -> Result<Arc<dyn Converter>> {
        self.converters.resolve(&ConverterId::new(
            &args.otw_format,
            &args.cpu_format,
            self.endianness,
        ))
    }

    /// Check each channel's wire signature and collect its block binding.
    fn check_signatures(&self, args: &StreamArgs) -> Result<Vec<(Arc<dyn BlockPort>, usize)>> {
        let mut bindings = Vec::with_capacity(args.channels.len());
        let mut fixed_packet_size: Option<usize> = None;
        for (chan, spec) in args.channels.iter().enumerate() {
            let block = self.block(spec.block)?;
            let sig = block.stream_signature(spec.port);
            if sig.item_type != args.otw_format {
                return Err(Error::IncompatibleStreamSignature(format!(
                    "{} channel {chan}: wire item type {} does not match requested {}",
                    block.block_id(),
                    sig.item_type,
                    args.otw_format
                )));
            }
            if let Some(size) = sig.packet_size {
                match fixed_packet_size {
                    Some(other) if other != size => {
                        return Err(Error::IncompatibleStreamSignature(format!(
                            "{} channel {chan}: fixed packet size {size} conflicts with \
                             {other} required by another channel",
                            block.block_id()
                        )));
                    }
                    _ => fixed_packet_size = Some(size),
                }
            }
            bindings.push((block, spec.port));
        }
        Ok(bindings)
    }

    /// Negotiate the samples-per-packet shared by every channel.
    ///
    /// The result is the minimum over the user request, each channel's
    /// fixed-signature packet size, every packetizing block's current
    /// setting, and each transport's frame capacity; it is then written
    /// back to every packetizing block so all channels agree.
    fn negotiate_spp(
        &self,
        args: &StreamArgs,
        bindings: &[(Arc<dyn BlockPort>, usize)],
        setups: &[ChannelSetup],
        otw_bytes_per_item: usize,
        recv_side: bool,
    ) -> Result<usize> {
        let mut spp: Option<usize> = args.spp;
        for (block, port) in bindings {
            if let Some(size) = block.stream_signature(*port).packet_size {
                let sig_spp = size / otw_bytes_per_item;
                spp = Some(spp.map_or(sig_spp, |s| s.min(sig_spp)));
            }
        }
        // Global scan: every packetizing block, not only the bound ones.
        // One streamer's packetization must be uniform across radios
        // sharing a flow-controlled window.
        {
            let blocks = self.blocks.lock().expect("block registry poisoned");
            for block in blocks.iter() {
                if let Some(current) = block.samples_per_packet() {
                    spp = Some(spp.map_or(current, |s| s.min(current)));
                }
            }
        }
        for setup in setups {
            let frame_words = if recv_side {
                setup.transport.link.recv_frame_words()
            } else {
                setup.transport.link.send_frame_words()
            };
            let payload_words = frame_words.checked_sub(MAX_HEADER_WORDS).ok_or_else(|| {
                Error::Value(format!(
                    "{}: transport frame of {frame_words} words cannot hold a \
                     {MAX_HEADER_WORDS} word header",
                    setup.block.block_id()
                ))
            })?;
            let capacity = payload_words * WORD_SIZE / otw_bytes_per_item;
            spp = Some(spp.map_or(capacity, |s| s.min(capacity)));
        }
        // The frame-capacity pass always constrains spp when any channel
        // exists.
        let spp = spp.unwrap_or(0);
        if spp == 0 {
            return Err(Error::Value(
                "negotiated samples per packet is zero".into(),
            ));
        }

        let blocks = self.blocks.lock().expect("block registry poisoned");
        for block in blocks.iter() {
            if block.samples_per_packet().is_some() {
                block.set_samples_per_packet(spp)?;
            }
        }
        Ok(spp)
    }

    fn make_channel_setups(
        &self,
        bindings: &[(Arc<dyn BlockPort>, usize)],
        kind: TransportKind,
    ) -> Result<Vec<ChannelSetup>> {
        let mut setups = Vec::with_capacity(bindings.len());
        for (chan, (block, port)) in bindings.iter().enumerate() {
            let endpoint = block.address(*port).map_err(|e| {
                Error::AddressResolution(format!(
                    "{} channel {chan}: {e}",
                    block.block_id()
                ))
            })?;
            let route = self.context.allocate_route(endpoint)?;
            let transport = self.provider.make_transport(route, kind)?;
            setups.push(ChannelSetup {
                block: Arc::clone(block),
                port: *port,
                transport,
            });
        }
        Ok(setups)
    }

    fn prune_and_insert_rx(&self, id: &str, streamer: &Arc<RxStreamer>) {
        let mut map = self.rx_streamers.lock().expect("rx streamer map poisoned");
        map.retain(|_, weak| weak.strong_count() > 0);
        map.insert(id.to_string(), Arc::downgrade(streamer));
    }

    fn prune_and_insert_tx(&self, id: &str, streamer: &Arc<TxStreamer>) {
        let mut map = self.tx_streamers.lock().expect("tx streamer map poisoned");
        map.retain(|_, weak| weak.strong_count() > 0);
        map.insert(id.to_string(), Arc::downgrade(streamer));
    }

    pub fn get_rx_stream(&self, args: &StreamArgs) -> Result<Arc<RxStreamer>> {
        let _setup = self.setup_lock.lock().expect("setup lock poisoned");
        if args.channels.is_empty() {
            return Err(Error::Value("rx stream requested with zero channels".into()));
        }
        let converter = self.resolve_converter(args)?;
        let otw_bpi = converter.otw_bytes_per_item();
        let bindings = self.check_signatures(args)?;
        let setups = self.make_channel_setups(&bindings, TransportKind::RxData)?;
        let spp = self.negotiate_spp(args, &bindings, &setups, otw_bpi, true)?;
        let pkt_bytes = MAX_HEADER_WORDS * WORD_SIZE + spp * otw_bpi;

        let fullness = args.hint_f64("recv_buff_fullness")?;
        let max_window = args.hint_usize("max_recv_window")?;
        let request_freq = args
            .hint_u32("rx_fc_request_freq")?
            .unwrap_or(DEFAULT_RX_FC_REQUEST_FREQ);

        let terminator = Arc::new(StreamTerminator::new(Direction::Rx, setups.len())?);
        let wire = wire_format(self.endianness);
        let mut channels = Vec::with_capacity(setups.len());
        for (chan, setup) in setups.into_iter().enumerate() {
            let window_pkts = rx_window_packets(
                pkt_bytes,
                setup.transport.recv_buff_bytes,
                fullness,
                max_window,
            )
            .map_err(|e| {
                Error::Value(format!("{} channel {chan}: {e}", setup.block.block_id()))
            })?;
            let window_bytes = (window_pkts * pkt_bytes) as u32;
            let interval = rx_fc_interval_bytes(window_bytes, pkt_bytes as u32, request_freq);
            setup
                .block
                .configure_flow_control_out(true, window_pkts, 0, setup.port)?;
            terminator.connect(Arc::clone(&setup.block), setup.port)?;
            debug!(
                channel = chan,
                window_pkts, interval, "rx channel flow control configured"
            );
            // Data flows device to host; credit reports travel the
            // allocated route.
            channels.push(RxChannel {
                link: Arc::clone(&setup.transport.link),
                fc: RxFlowState::new(setup.transport.recv_addr, interval, wire),
                next_seq: None,
            });
        }

        let streamer = RxStreamer::new(terminator, channels, converter, wire, spp);
        self.prune_and_insert_rx(streamer.terminator_id(), &streamer);
        info!(
            id = streamer.terminator_id(),
            channels = streamer.num_channels(),
            spp,
            "rx streamer created"
        );
        Ok(streamer)
    }

    pub fn get_tx_stream(&self, args: &StreamArgs) -> Result<Arc<TxStreamer>> {
        let _setup = self.setup_lock.lock().expect("setup lock poisoned");
        if args.channels.is_empty() {
            return Err(Error::Value("tx stream requested with zero channels".into()));
        }
        let converter = self.resolve_converter(args)?;
        let otw_bpi = converter.otw_bytes_per_item();
        let bindings = self.check_signatures(args)?;
        let setups = self.make_channel_setups(&bindings, TransportKind::TxData)?;
        let spp = self.negotiate_spp(args, &bindings, &setups, otw_bpi, false)?;
        let pkt_bytes = MAX_HEADER_WORDS * WORD_SIZE + spp * otw_bpi;

        let send_buff_hint = args.hint_usize("send_buff_size")?;

        // One async-message transport per streamer, routed to the first
        // bound block.
        let msg_endpoint = bindings[0].0.address(bindings[0].1)?;
        let msg_route = self.context.allocate_route(msg_endpoint)?;
        let msg_transport = self
            .provider
            .make_transport(msg_route, TransportKind::AsyncMsg)?;

        let terminator = Arc::new(StreamTerminator::new(Direction::Tx, setups.len())?);
        let wire = wire_format(self.endianness);
        let mut channels = Vec::with_capacity(setups.len());
        for (chan, setup) in setups.into_iter().enumerate() {
            let fifo = setup.block.fifo_bytes(setup.port);
            let window_bytes = tx_window_bytes(
                fifo,
                setup.transport.send_buff_bytes,
                send_buff_hint,
            )
            .map_err(|e| {
                Error::Value(format!("{} channel {chan}: {e}", setup.block.block_id()))
            })?;
            let window_pkts = (window_bytes / pkt_bytes).max(1);
            let interval_pkts = (window_pkts / DEFAULT_TX_FC_RESPONSE_FREQ as usize).max(1);
            setup
                .block
                .configure_flow_control_in(interval_pkts, setup.port)?;
            terminator.connect(Arc::clone(&setup.block), setup.port)?;
            debug!(
                channel = chan,
                window_bytes, interval_pkts, "tx channel flow control configured"
            );
            channels.push(TxChannel {
                link: Arc::clone(&setup.transport.link),
                fc: TxFlowState::new(window_bytes as u32, wire),
                seq: 0,
                addr: setup.transport.send_addr,
            });
        }

        let streamer = TxStreamer::new(
            terminator,
            channels,
            converter,
            wire,
            spp,
            Arc::clone(&msg_transport.link),
            Arc::clone(&self.legacy_async),
        );
        self.prune_and_insert_tx(streamer.terminator_id(), &streamer);
        info!(
            id = streamer.terminator_id(),
            channels = streamer.num_channels(),
            spp,
            "tx streamer created"
        );
        Ok(streamer)
    }

    /// Push a sample-rate change to every live rx streamer.
    pub fn update_rx_rate(&self, rate: f64) {
        let mut map = self.rx_streamers.lock().expect("rx streamer map poisoned");
        map.retain(|_, weak| weak.strong_count() > 0);
        for weak in map.values() {
            if let Some(streamer) = weak.upgrade() {
                streamer.set_sample_rate(rate);
            }
        }
    }

    /// Push a sample-rate change to every live tx streamer.
    pub fn update_tx_rate(&self, rate: f64) {
        let mut map = self.tx_streamers.lock().expect("tx streamer map poisoned");
        map.retain(|_, weak| weak.strong_count() > 0);
        for weak in map.values() {
            if let Some(streamer) = weak.upgrade() {
                streamer.set_sample_rate(rate);
            }
        }
    }

    /// Device-wide status messages across all tx streamers, oldest first.
    pub fn recv_async_msg(&self, timeout: Duration) -> Option<AsyncMsg> {
        self.legacy_async.pop(timeout)
    }

    pub fn num_live_rx_streamers(&self) -> usize {
        let mut map = self.rx_streamers.lock().expect("rx streamer map poisoned");
        map.retain(|_, weak| weak.strong_count() > 0);
        map.len()
    }

    pub fn num_live_tx_streamers(&self) -> usize {
        let mut map = self.tx_streamers.lock().expect("tx streamer map poisoned");
        map.retain(|_, weak| weak.strong_count() > 0);
        map.len()
    }
}
