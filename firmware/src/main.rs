#![no_std]
#![no_main]

//! USB Audio Class sound card with on-device DSP: stereo S/PDIF plus a
//! sigma-delta PDM subwoofer output, on the RP2040.
//!
//! Core 0 runs the embassy executor with the USB device, the DSP engine
//! and the S/PDIF transmitter; core 1 runs the PDM modulator loop from
//! RAM. The main task is the control plane: it pets the watchdog (only
//! while core 1's heartbeat advances) and samples the die temperature.

use core::sync::atomic::Ordering::Relaxed;

use audio::pipeline::SUPPORTED_RATES_HZ;
use audio::spdif::SpdifBlock;
use defmt::{info, unwrap, warn};
use embassy_executor::Spawner;
use embassy_rp::multicore::{spawn_core1, Stack};
use embassy_rp::watchdog::Watchdog;
use embassy_rp::{adc, bind_interrupts, peripherals, pio, usb};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::zerocopy_channel;
use embassy_time::{Duration, Ticker};
use embassy_usb::msos::windows_version;
use heapless::Vec;
use picodac::spdif_out::SpdifOut;
use picodac::{
    audio_routing, clock_manager, flash_store, pdm_out, spdif_out, uac1, usb_audio, vendor,
    UsbSampleBlock, CORE1_HEARTBEAT, DEFAULT_SAMPLE_RATE_HZ, SPDIF_BLOCK_COUNT, STATUS,
    USB_MAX_PACKET_SIZE,
};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

bind_interrupts!(struct Irqs {
    USBCTRL_IRQ => usb::InterruptHandler<peripherals::USB>;
    PIO0_IRQ_0 => pio::InterruptHandler<peripherals::PIO0>;
    PIO1_IRQ_0 => pio::InterruptHandler<peripherals::PIO1>;
    ADC_IRQ_FIFO => adc::InterruptHandler;
});

static mut CORE1_STACK: Stack<4096> = Stack::new();

/// RP2040 die temperature from the internal sensor, in millidegrees C.
fn temperature_mc(raw: u16) -> i32 {
    let voltage = raw as f32 * 3.3 / 4096.0;
    let temp_c = 27.0 - (voltage - 0.706) / 0.001721;
    (temp_c * 1000.0) as i32
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Default::default());
    info!("Boot");

    // Clock tree for the 48 kHz family; rate changes re-lock the PLL later.
    clock_manager::init(DEFAULT_SAMPLE_RATE_HZ).await;

    let mut watchdog = Watchdog::new(p.WATCHDOG);

    // ------------------------------------------------------------------
    // USB device: UAC1 speaker function plus the vendor DSP interface.
    // ------------------------------------------------------------------
    let usb_driver = usb::Driver::new(p.USB, Irqs);

    let mut config = embassy_usb::Config::new(0x2e8a, 0xfedd);
    config.manufacturer = Some("picodac");
    config.product = Some("USB DSP DAC 2.1");
    config.serial_number = Some("00000001");
    config.max_power = 100;
    config.max_packet_size_0 = 64;

    // Composite device with IADs, required for Windows to bind the audio
    // function and the vendor interface separately.
    config.device_class = 0xEF;
    config.device_sub_class = 0x02;
    config.device_protocol = 0x01;
    config.composite_with_iads = true;

    static CONFIG_DESCRIPTOR: StaticCell<[u8; 512]> = StaticCell::new();
    let config_descriptor = CONFIG_DESCRIPTOR.init([0; 512]);

    static BOS_DESCRIPTOR: StaticCell<[u8; 64]> = StaticCell::new();
    let bos_descriptor = BOS_DESCRIPTOR.init([0; 64]);

    static MSOS_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
    let msos_descriptor = MSOS_DESCRIPTOR.init([0; 256]);

    static CONTROL_BUF: StaticCell<[u8; 64]> = StaticCell::new();
    let control_buf = CONTROL_BUF.init([0; 64]);

    let mut builder = embassy_usb::Builder::new(
        usb_driver,
        config,
        config_descriptor,
        bos_descriptor,
        msos_descriptor,
        control_buf,
    );
    builder.msos_descriptor(windows_version::WIN8_1, 2);

    static UAC_STATE: StaticCell<uac1::State> = StaticCell::new();
    let uac_state = UAC_STATE.init(uac1::State::new());
    let speaker = uac1::Speaker::new(
        &mut builder,
        uac_state,
        USB_MAX_PACKET_SIZE as u16,
        &SUPPORTED_RATES_HZ,
    );
    let (stream, feedback, control_monitor) = speaker.split();

    static VENDOR_STATE: StaticCell<vendor::State> = StaticCell::new();
    let vendor_state = VENDOR_STATE.init(vendor::State::new());
    vendor::install(&mut builder, vendor_state);

    let usb_device = builder.build();

    // ------------------------------------------------------------------
    // Zero-copy channels: USB packets to the engine, encoded S/PDIF
    // blocks from the engine to the transmitter.
    // ------------------------------------------------------------------
    static USB_SAMPLE_BLOCKS: StaticCell<[UsbSampleBlock; 2]> = StaticCell::new();
    let usb_sample_blocks = USB_SAMPLE_BLOCKS.init([Vec::new(), Vec::new()]);

    static USB_CHANNEL: StaticCell<zerocopy_channel::Channel<'_, NoopRawMutex, UsbSampleBlock>> =
        StaticCell::new();
    let usb_channel = USB_CHANNEL.init(zerocopy_channel::Channel::new(usb_sample_blocks));
    let (usb_sender, usb_receiver) = usb_channel.split();

    const EMPTY_BLOCK: SpdifBlock = SpdifBlock::new();
    static SPDIF_BLOCKS: StaticCell<[SpdifBlock; SPDIF_BLOCK_COUNT]> = StaticCell::new();
    let spdif_blocks = SPDIF_BLOCKS.init([EMPTY_BLOCK; SPDIF_BLOCK_COUNT]);

    static SPDIF_CHANNEL: StaticCell<zerocopy_channel::Channel<'_, NoopRawMutex, SpdifBlock>> =
        StaticCell::new();
    let spdif_channel = SPDIF_CHANNEL.init(zerocopy_channel::Channel::new(spdif_blocks));
    let (spdif_sender, spdif_receiver) = spdif_channel.split();

    // ------------------------------------------------------------------
    // PIO0: S/PDIF transmitter. PIO1: PDM bitstream, fed by core 1.
    // ------------------------------------------------------------------
    let sys_clk_hz = clock_manager::sys_clk_hz();

    let pio::Pio {
        mut common, sm0, ..
    } = pio::Pio::new(p.PIO0, Irqs);
    let spdif = SpdifOut::new(
        &mut common,
        sm0,
        p.DMA_CH0.into(),
        p.PIN_20,
        sys_clk_hz,
        DEFAULT_SAMPLE_RATE_HZ,
    );
    // A single output still starts through the sync-group path, so adding
    // a second S/PDIF stream keeps both sample-aligned.
    spdif_out::enable_in_sync(spdif.sm_mask());

    let pio::Pio {
        common: mut pdm_common,
        sm0: pdm_sm0,
        ..
    } = pio::Pio::new(p.PIO1, Irqs);
    let mut pdm = pdm_out::PdmOut::new(
        &mut pdm_common,
        pdm_sm0,
        p.PIN_10,
        sys_clk_hz,
        DEFAULT_SAMPLE_RATE_HZ,
    );
    pdm.start_dma(p.DMA_CH1.into());

    // The modulator loop runs from RAM on core 1 from here to power-off.
    spawn_core1(
        p.CORE1,
        unsafe { &mut *core::ptr::addr_of_mut!(CORE1_STACK) },
        || pdm_out::core1_main(),
    );

    let store = flash_store::ParamStore::new(p.FLASH);

    unwrap!(spawner.spawn(usb_audio::usb_task(usb_device)));
    unwrap!(spawner.spawn(usb_audio::streaming_task(stream, usb_sender)));
    unwrap!(spawner.spawn(usb_audio::feedback_task(feedback)));
    unwrap!(spawner.spawn(usb_audio::control_task(control_monitor)));
    unwrap!(spawner.spawn(audio_routing::engine_task(
        usb_receiver,
        spdif_sender,
        store
    )));
    unwrap!(spawner.spawn(spdif_out::spdif_output_task(spdif, spdif_receiver)));

    // ------------------------------------------------------------------
    // Control plane: watchdog with a core-1 liveness gate, plus die
    // temperature for status read-back.
    // ------------------------------------------------------------------
    let mut adc = adc::Adc::new(p.ADC, Irqs, adc::Config::default());
    let mut temp_sensor = adc::Channel::new_temp_sensor(p.ADC_TEMP_SENSOR);

    watchdog.start(Duration::from_millis(8_000));

    let mut last_heartbeat = CORE1_HEARTBEAT.load(Relaxed);
    let mut ticker = Ticker::every(Duration::from_millis(500));
    let mut temperature_divider = 0u32;

    loop {
        ticker.next().await;

        let heartbeat = CORE1_HEARTBEAT.load(Relaxed);
        if heartbeat != last_heartbeat {
            watchdog.feed();
        } else {
            // Deliberately starve the watchdog: a hung modulator must
            // reset the whole device, not silently kill the sub output.
            warn!("Core 1 heartbeat stalled");
        }
        last_heartbeat = heartbeat;

        temperature_divider += 1;
        if temperature_divider >= 2 {
            temperature_divider = 0;
            if let Ok(raw) = adc.read(&mut temp_sensor).await {
                STATUS.temperature_mc.store(temperature_mc(raw), Relaxed);
            }
        }
    }
}
