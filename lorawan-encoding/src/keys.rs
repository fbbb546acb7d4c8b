//! Key and identifier newtypes, plus the [`CryptoFactory`] abstraction over AES-128/CMAC.
//!
//! The MAC never stores raw key bytes itself (see the `SecurityModule` trait in `lorawan-mac`);
//! these newtypes exist so the type system -- not convention -- prevents an `AppSKey` from being
//! passed where a `NwkKey` is expected.

macro_rules! lorawan_key {
    ($(#[$outer:meta])* pub struct $type:ident(AES128);) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
        pub struct $type(pub AES128);

        impl From<[u8; 16]> for $type {
            fn from(key: [u8; 16]) -> Self {
                $type(AES128(key))
            }
        }

        impl AsRef<[u8]> for $type {
            fn as_ref(&self) -> &[u8] {
                &self.0 .0
            }
        }
    };
}

lorawan_key!(
    /// Root application key. Never leaves the security module.
    pub struct AppKey(AES128);
);
lorawan_key!(
    /// L2 1.1 root network key. Never leaves the security module.
    pub struct NwkKey(AES128);
);
lorawan_key!(
    /// L2 1.0.x network session key / L2 1.1 forwarding network session key.
    pub struct FNwkSIntKey(AES128);
);
lorawan_key!(
    /// L2 1.1 serving network session integrity key.
    pub struct SNwkSIntKey(AES128);
);
lorawan_key!(
    /// L2 1.1 network session encryption key (encrypts FOpts and port-0 FRMPayload).
    pub struct NwkSEncKey(AES128);
);
lorawan_key!(
    /// Application session key (encrypts FRMPayload for ports > 0).
    pub struct AppSKey(AES128);
);
lorawan_key!(
    /// L2 1.1 join-server encryption key, used to decrypt Join-Accept.
    pub struct JSEncKey(AES128);
);
lorawan_key!(
    /// L2 1.1 join-server integrity key, used to verify Join-Accept MIC.
    pub struct JSIntKey(AES128);
);

macro_rules! lorawan_eui {
    ($(#[$outer:meta])* pub struct $type:ident;) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
        pub struct $type(pub [u8; 8]);

        impl From<[u8; 8]> for $type {
            fn from(eui: [u8; 8]) -> Self {
                $type(eui)
            }
        }

        impl AsRef<[u8]> for $type {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

lorawan_eui!(
    /// Device identity EUI-64, entered MSB-first as printed on the device label.
    pub struct DevEui;
);
lorawan_eui!(
    /// Join-server identity EUI-64 (called AppEUI prior to LoRaWAN 1.1).
    pub struct JoinEui;
);

/// Raw AES-128 key bytes, used where the caller hasn't committed to a specific role yet
/// (e.g. inside [`CryptoFactory`]).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct AES128(pub [u8; 16]);

impl From<[u8; 16]> for AES128 {
    fn from(v: [u8; 16]) -> Self {
        AES128(v)
    }
}

/// Trait for a single-block AES-128 ECB encrypter.
pub trait Encrypter {
    fn encrypt_block(&self, block: &mut [u8; 16]);
}

/// Trait for a single-block AES-128 ECB decrypter.
pub trait Decrypter {
    fn decrypt_block(&self, block: &mut [u8; 16]);
}

/// Trait for an AES-CMAC accumulator.
pub trait Cmac {
    fn input(&mut self, data: &[u8]);
    fn result(self) -> [u8; 16];
}

/// Abstraction over the crypto primitives the codec layer needs. A default software
/// implementation is provided under the `default-crypto` feature; a production device may swap
/// in a hardware-backed one (e.g. a secure element) without touching the codec or MAC layers.
pub trait CryptoFactory {
    type E: Encrypter;
    type D: Decrypter;
    type M: Cmac;

    fn new_enc(&self, key: &AES128) -> Self::E;
    fn new_dec(&self, key: &AES128) -> Self::D;
    fn new_mac(&self, key: &AES128) -> Self::M;
}
