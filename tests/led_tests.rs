//! Integration tests for addressable LED strips and the shared LED buffer.

use smartio_hal::transport::Value;
use smartio_hal::{status, Error, Hal, LedData, LED_MAX_LENGTH};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn published(hal: &Hal, entry: &str, channel: u8) -> Option<Value> {
    hal.store()
        .get_value(&format!("/io/{}/{}", channel, entry))
        .map(|v| v.value)
}

#[test]
fn test_start_bounds() {
    init_logging();
    let hal = Hal::default();
    let led = hal.initialize_addressable_led(11, "strip").unwrap();
    assert_eq!(hal.get_addressable_led_range(led).unwrap(), (0, 0));
    assert_eq!(published(&hal, "ledoffset", 11), Some(Value::Integer(0)));
    assert_eq!(published(&hal, "ledcount", 11), Some(Value::Integer(0)));

    hal.set_addressable_led_start(led, 0).unwrap();
    hal.set_addressable_led_start(led, LED_MAX_LENGTH - 1).unwrap();
    assert_eq!(
        published(&hal, "ledoffset", 11),
        Some(Value::Integer(LED_MAX_LENGTH as i64 - 1))
    );

    let err = hal
        .set_addressable_led_start(led, LED_MAX_LENGTH)
        .unwrap_err();
    assert_eq!(err.status_code(), status::PARAMETER_OUT_OF_RANGE);
    assert!(hal.set_addressable_led_start(led, -1).is_err());
    // Rejected values are not published.
    assert_eq!(
        published(&hal, "ledoffset", 11),
        Some(Value::Integer(LED_MAX_LENGTH as i64 - 1))
    );
    assert_eq!(
        hal.get_addressable_led_range(led).unwrap(),
        (LED_MAX_LENGTH - 1, 0)
    );
}

#[test]
fn test_length_bounds() {
    init_logging();
    let hal = Hal::default();
    let led = hal.initialize_addressable_led(12, "strip").unwrap();
    hal.set_addressable_led_length(led, 0).unwrap();
    hal.set_addressable_led_length(led, LED_MAX_LENGTH - 1).unwrap();
    assert!(matches!(
        hal.set_addressable_led_length(led, LED_MAX_LENGTH),
        Err(Error::ParameterOutOfRange(_))
    ));
    assert!(hal.set_addressable_led_length(led, -1).is_err());
    assert_eq!(
        hal.get_addressable_led_range(led).unwrap(),
        (0, LED_MAX_LENGTH - 1)
    );

    // The window may not run past the end of the buffer.
    assert!(hal.set_addressable_led_start(led, 1).is_err());
    hal.set_addressable_led_length(led, 100).unwrap();
    hal.set_addressable_led_start(led, 500).unwrap();
    assert_eq!(hal.get_addressable_led_range(led).unwrap(), (500, 100));
}

#[test]
fn test_strips_share_one_buffer() {
    init_logging();
    let hal = Hal::default();
    let first = hal.initialize_addressable_led(1, "first").unwrap();
    let second = hal.initialize_addressable_led(2, "second").unwrap();
    hal.set_addressable_led_length(first, 10).unwrap();
    hal.set_addressable_led_length(second, 10).unwrap();
    hal.set_addressable_led_start(second, 10).unwrap();

    let red = [LedData::new(255, 0, 0); 10];
    let blue = [LedData::new(0, 0, 255); 10];
    hal.set_addressable_led_data(0, &red).unwrap();
    hal.set_addressable_led_data(10, &blue).unwrap();

    let all = hal.get_addressable_led_data(0, 20).unwrap();
    assert_eq!(&all[..10], &red);
    assert_eq!(&all[10..], &blue);

    let Some(Value::Raw(bytes)) = hal.store().get_value("/io/led/data").map(|v| v.value) else {
        panic!("LED buffer not published");
    };
    assert_eq!(bytes.len(), LED_MAX_LENGTH as usize * 3);
    assert_eq!(&bytes[27..33], &[255, 0, 0, 0, 0, 255]);

    hal.free_addressable_led(first);
    // The buffer outlives the strips.
    assert_eq!(hal.get_addressable_led_data(0, 1).unwrap(), [red[0]]);
    assert!(hal.get_addressable_led_range(first).is_err());
    assert!(hal.get_addressable_led_range(second).is_ok());
}

#[test]
fn test_data_outside_buffer_rejected() {
    init_logging();
    let hal = Hal::default();
    let pixel = [LedData::new(1, 1, 1)];
    hal.set_addressable_led_data(LED_MAX_LENGTH - 1, &pixel).unwrap();
    assert!(hal.set_addressable_led_data(LED_MAX_LENGTH, &pixel).is_err());
    assert!(hal
        .set_addressable_led_data(LED_MAX_LENGTH - 1, &[pixel[0], pixel[0]])
        .is_err());
    assert!(hal.get_addressable_led_data(LED_MAX_LENGTH - 1, 2).is_err());
    assert_eq!(
        hal.get_addressable_led_data(LED_MAX_LENGTH - 1, 1).unwrap(),
        pixel
    );
}
