//! USB audio tasks: stream reception, feedback transmission, and class
//! control monitoring.

use defmt::{debug, info, panic};
use embassy_rp::peripherals::USB;
use embassy_rp::usb;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::zerocopy_channel;
use embassy_time::Instant;
use embassy_usb::driver::EndpointError;

use crate::uac1;
use crate::{
    ControlEvent, UsbSampleBlock, CONTROL_EVENTS, DEFAULT_SAMPLE_RATE_HZ, DRIFT,
    INPUT_CHANNEL_COUNT, SAMPLE_SIZE, USB_IS_STREAMING, USB_MAX_PACKET_SIZE,
};

pub type UsbDriver = usb::Driver<'static, USB>;

struct Disconnected {}

impl From<EndpointError> for Disconnected {
    fn from(val: EndpointError) -> Self {
        match val {
            EndpointError::BufferOverflow => panic!("Buffer overflow"),
            EndpointError::Disabled => Disconnected {},
        }
    }
}

async fn stream_handler(
    stream: &mut uac1::Stream<'static, UsbDriver>,
    sender: &mut zerocopy_channel::Sender<'static, NoopRawMutex, UsbSampleBlock>,
) -> Result<(), Disconnected> {
    const FRAME_BYTES: usize = SAMPLE_SIZE * INPUT_CHANNEL_COUNT;

    loop {
        let mut usb_data = [0u8; USB_MAX_PACKET_SIZE];
        let data_size = stream.read_packet(&mut usb_data).await?;

        if data_size % FRAME_BYTES != 0 {
            debug!("Invalid USB buffer size of {}, skipped.", data_size);
            continue;
        }

        // Obtain a buffer from the channel
        let samples = sender.send().await;
        samples.clear();

        for sample in usb_data[..data_size].chunks_exact(2) {
            // Capacity covers the largest advertised packet.
            let _ = samples.push(i16::from_le_bytes([sample[0], sample[1]]));
        }

        sender.send_done();
    }
}

async fn feedback_handler(
    feedback: &mut uac1::Feedback<'static, UsbDriver>,
) -> Result<(), Disconnected> {
    loop {
        // Each write completes when the host polls the feedback endpoint,
        // so the loop naturally runs at the advertised refresh cadence.
        let value = DRIFT.lock(|d| d.borrow().feedback_value(Instant::now().as_micros()));
        feedback.write_packet(&value.to_le_bytes()[..3]).await?;
    }
}

#[embassy_executor::task]
pub async fn streaming_task(
    mut stream: uac1::Stream<'static, UsbDriver>,
    mut sender: zerocopy_channel::Sender<'static, NoopRawMutex, UsbSampleBlock>,
) {
    loop {
        stream.wait_connection().await;
        info!("Stream connected");
        USB_IS_STREAMING.store(true, core::sync::atomic::Ordering::Relaxed);
        _ = stream_handler(&mut stream, &mut sender).await;
        USB_IS_STREAMING.store(false, core::sync::atomic::Ordering::Relaxed);
        info!("Stream disconnected");
    }
}

#[embassy_executor::task]
pub async fn feedback_task(mut feedback: uac1::Feedback<'static, UsbDriver>) {
    loop {
        feedback.wait_connection().await;
        _ = feedback_handler(&mut feedback).await;
    }
}

#[embassy_executor::task]
pub async fn usb_task(mut usb_device: embassy_usb::UsbDevice<'static, UsbDriver>) {
    usb_device.run().await;
}

/// Forwards feature-unit and sampling-frequency changes from the class
/// control handler to the engine.
#[embassy_executor::task]
pub async fn control_task(control_monitor: uac1::ControlMonitor<'static>) {
    let mut current_rate_hz = DEFAULT_SAMPLE_RATE_HZ;

    loop {
        control_monitor.changed().await;

        let settings = control_monitor.audio_settings();

        // The host writes identical codes to both channels for a master
        // change; the left channel stands in for the master volume.
        CONTROL_EVENTS
            .send(ControlEvent::Volume(settings.volume_8q8_db[0]))
            .await;
        CONTROL_EVENTS
            .send(ControlEvent::Mute(
                settings.is_muted[0] && settings.is_muted[1],
            ))
            .await;

        let rate_hz = control_monitor.sample_rate_hz();
        if rate_hz != 0 && rate_hz != current_rate_hz {
            current_rate_hz = rate_hz;
            info!("Host requested {} Hz", rate_hz);
            CONTROL_EVENTS.send(ControlEvent::SampleRate(rate_hz)).await;
        }
    }
}
