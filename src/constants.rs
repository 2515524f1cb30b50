//! gs_usb protocol constants
//!
//! Control request codes, USB identifiers, host frame sizes and the CAN
//! identifier bits used on the wire. Feature and mode bits live in
//! [`crate::structures`] as bitflags types.

use std::time::Duration;

// ============================================================================
// CAN ID Flags (in gs_host_frame.can_id)
// ============================================================================

/// Extended frame format flag (29-bit ID)
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Remote transmission request flag
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
/// Error message frame flag
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;

// ============================================================================
// CAN ID Masks
// ============================================================================

/// Standard frame format mask (11-bit ID)
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Extended frame format mask (29-bit ID)
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

// ============================================================================
// CAN Payload Definitions
// ============================================================================

/// Maximum data length for classic CAN
pub const CAN_MAX_DLEN: usize = 8;
/// Maximum DLC for CAN FD
pub const CANFD_MAX_DLC: u8 = 15;
/// Maximum data length for CAN FD
pub const CANFD_MAX_DLEN: usize = 64;

/// DLC to data length conversion table for CAN FD
pub const CANFD_DLC_TO_LEN: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

// ============================================================================
// gs_host_frame flags byte
// ============================================================================

/// RX overflow occurred on the device
pub const GS_CAN_FLAG_OVERFLOW: u8 = 1 << 0;
/// CAN FD frame
pub const GS_CAN_FLAG_FD: u8 = 1 << 1;
/// Bit rate switch
pub const GS_CAN_FLAG_BRS: u8 = 1 << 2;
/// Error state indicator
pub const GS_CAN_FLAG_ESI: u8 = 1 << 3;
/// Bits of the flags byte with no defined meaning
pub const GS_CAN_FLAG_RESERVED_MASK: u8 = 0xF0;

// ============================================================================
// Host frame layout
// ============================================================================

/// Echo ID carried by frames received from the bus
pub const GS_USB_RX_ECHO_ID: u32 = 0xFFFF_FFFF;

/// Size of the fixed header preceding the payload
pub const GS_USB_FRAME_HEADER_SIZE: usize = 12;
/// Size of the trailing hardware timestamp
pub const GS_USB_TIMESTAMP_SIZE: usize = 4;

/// Classic CAN frame size (without timestamp)
pub const GS_USB_FRAME_SIZE: usize = 20;
/// Classic CAN frame size (with hardware timestamp)
pub const GS_USB_FRAME_SIZE_HW_TIMESTAMP: usize = 24;
/// CAN FD frame size (without timestamp)
pub const GS_USB_FRAME_SIZE_FD: usize = 76;
/// CAN FD frame size (with hardware timestamp)
pub const GS_USB_FRAME_SIZE_FD_HW_TIMESTAMP: usize = 80;

// ============================================================================
// USB Vendor/Product IDs
// ============================================================================

/// GS-USB default vendor ID
pub const GS_USB_ID_VENDOR: u16 = 0x1D50;
/// GS-USB default product ID
pub const GS_USB_ID_PRODUCT: u16 = 0x606F;

/// Candlelight vendor ID
pub const GS_USB_CANDLELIGHT_VENDOR_ID: u16 = 0x1209;
/// Candlelight product ID
pub const GS_USB_CANDLELIGHT_PRODUCT_ID: u16 = 0x2323;

/// CES CANext FD vendor ID
pub const GS_USB_CES_CANEXT_FD_VENDOR_ID: u16 = 0x1CD2;
/// CES CANext FD product ID
pub const GS_USB_CES_CANEXT_FD_PRODUCT_ID: u16 = 0x606F;

/// ABE CANdebugger FD vendor ID
pub const GS_USB_ABE_CANDEBUGGER_FD_VENDOR_ID: u16 = 0x16D0;
/// ABE CANdebugger FD product ID
pub const GS_USB_ABE_CANDEBUGGER_FD_PRODUCT_ID: u16 = 0x10B8;

/// Every (vendor, product) pair enumerated by default
pub const GS_USB_KNOWN_IDS: [(u16, u16); 4] = [
    (GS_USB_ID_VENDOR, GS_USB_ID_PRODUCT),
    (GS_USB_CANDLELIGHT_VENDOR_ID, GS_USB_CANDLELIGHT_PRODUCT_ID),
    (GS_USB_CES_CANEXT_FD_VENDOR_ID, GS_USB_CES_CANEXT_FD_PRODUCT_ID),
    (
        GS_USB_ABE_CANDEBUGGER_FD_VENDOR_ID,
        GS_USB_ABE_CANDEBUGGER_FD_PRODUCT_ID,
    ),
];

// ============================================================================
// GS-USB Control Request Codes
// ============================================================================

/// Set host byte order (legacy)
pub const GS_USB_BREQ_HOST_FORMAT: u8 = 0;
/// Set bit timing
pub const GS_USB_BREQ_BITTIMING: u8 = 1;
/// Set/start mode
pub const GS_USB_BREQ_MODE: u8 = 2;
/// Get bus errors
pub const GS_USB_BREQ_BERR: u8 = 3;
/// Get bit timing constants
pub const GS_USB_BREQ_BT_CONST: u8 = 4;
/// Get device configuration
pub const GS_USB_BREQ_DEVICE_CONFIG: u8 = 5;
/// Get timestamp
pub const GS_USB_BREQ_TIMESTAMP: u8 = 6;
/// Identify device (blink LED)
pub const GS_USB_BREQ_IDENTIFY: u8 = 7;
/// Get user ID
pub const GS_USB_BREQ_GET_USER_ID: u8 = 8;
/// Set user ID
pub const GS_USB_BREQ_SET_USER_ID: u8 = 9;
/// Set data phase bit timing (CAN FD)
pub const GS_USB_BREQ_DATA_BITTIMING: u8 = 10;
/// Get extended bit timing constants (CAN FD)
pub const GS_USB_BREQ_BT_CONST_EXT: u8 = 11;
/// Set termination
pub const GS_USB_BREQ_SET_TERMINATION: u8 = 12;
/// Get termination
pub const GS_USB_BREQ_GET_TERMINATION: u8 = 13;
/// Get CAN state
pub const GS_USB_BREQ_GET_STATE: u8 = 14;

/// Get a printable name for a control request code
pub fn request_name(request: u8) -> &'static str {
    match request {
        GS_USB_BREQ_HOST_FORMAT => "HOST_FORMAT",
        GS_USB_BREQ_BITTIMING => "BITTIMING",
        GS_USB_BREQ_MODE => "MODE",
        GS_USB_BREQ_BERR => "BERR",
        GS_USB_BREQ_BT_CONST => "BT_CONST",
        GS_USB_BREQ_DEVICE_CONFIG => "DEVICE_CONFIG",
        GS_USB_BREQ_TIMESTAMP => "TIMESTAMP",
        GS_USB_BREQ_IDENTIFY => "IDENTIFY",
        GS_USB_BREQ_GET_USER_ID => "GET_USER_ID",
        GS_USB_BREQ_SET_USER_ID => "SET_USER_ID",
        GS_USB_BREQ_DATA_BITTIMING => "DATA_BITTIMING",
        GS_USB_BREQ_BT_CONST_EXT => "BT_CONST_EXT",
        GS_USB_BREQ_SET_TERMINATION => "SET_TERMINATION",
        GS_USB_BREQ_GET_TERMINATION => "GET_TERMINATION",
        GS_USB_BREQ_GET_STATE => "GET_STATE",
        _ => "UNKNOWN",
    }
}

/// bmRequestType: vendor, interface recipient, host-to-device
pub const GS_USB_REQ_TYPE_OUT: u8 = 0x41;
/// bmRequestType: vendor, interface recipient, device-to-host
pub const GS_USB_REQ_TYPE_IN: u8 = 0xC1;

/// Byte-order marker sent with HOST_FORMAT
pub const GS_USB_HOST_FORMAT: u32 = 0x0000_BEEF;

// ============================================================================
// GS-USB Mode Values
// ============================================================================

/// Reset/stop mode
pub const GS_CAN_MODE_RESET: u32 = 0;
/// Start mode
pub const GS_CAN_MODE_START: u32 = 1;

/// Termination resistor disabled
pub const GS_CAN_TERMINATION_STATE_OFF: u32 = 0;
/// Termination resistor enabled
pub const GS_CAN_TERMINATION_STATE_ON: u32 = 1;

/// Identify LED off
pub const GS_CAN_IDENTIFY_OFF: u32 = 0;
/// Identify LED blinking
pub const GS_CAN_IDENTIFY_ON: u32 = 1;

// ============================================================================
// USB Endpoints
// ============================================================================

/// Bulk OUT endpoint (host to device)
pub const GS_USB_ENDPOINT_OUT: u8 = 0x02;
/// Bulk IN endpoint (device to host)
pub const GS_USB_ENDPOINT_IN: u8 = 0x81;

// ============================================================================
// Driver defaults
// ============================================================================

/// Receive transfers kept in flight while any channel runs
pub const DEFAULT_RX_TRANSFERS: usize = 8;
/// Frames buffered per channel awaiting `receive`
pub const DEFAULT_RX_FIFO_CAPACITY: usize = 20;
/// Queued frames a timestamped frame may move ahead of
pub const RX_REORDER_DEPTH: usize = 10;
/// Timestamp distance still treated as ordering rather than counter wrap
pub const RX_REORDER_WINDOW_US: u32 = 100_000;
/// Transmit transfers allowed in flight per channel
pub const DEFAULT_TX_CAPACITY: usize = 10;
/// Timeout applied to every control transfer
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
/// Timeout applied to each bulk OUT transfer
pub const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Upper bound on waiting for cancelled transfers to complete
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
