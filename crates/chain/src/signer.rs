use alloy_consensus::{SignableTransaction, TxEip1559, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, TxKind, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context, Result};
use bundler_core::{GasFees, SignedTransaction, UnsignedTransaction};

/// Hot-wallet key that signs bundle transactions.
#[derive(Debug, Clone)]
pub struct TransactionSigner {
    signer: PrivateKeySigner,
}

impl TransactionSigner {
    pub fn from_private_key(key: &str) -> Result<Self> {
        let signer = key
            .trim()
            .parse::<PrivateKeySigner>()
            .context("invalid signer private key")?;
        Ok(Self { signer })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Signs `tx` as EIP-1559 or legacy depending on its fee shape.
    pub fn sign(&self, tx: &UnsignedTransaction) -> Result<SignedTransaction> {
        let envelope: TxEnvelope = match tx.fees {
            GasFees::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let unsigned = TxEip1559 {
                    chain_id: tx.chain_id,
                    nonce: tx.nonce,
                    gas_limit: tx.gas_limit,
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                    to: TxKind::Call(tx.to),
                    value: U256::ZERO,
                    access_list: Default::default(),
                    input: tx.call_data.clone(),
                };
                let signature = self.signer.sign_hash_sync(&unsigned.signature_hash())?;
                unsigned.into_signed(signature).into()
            }
            GasFees::Legacy { gas_price } => {
                let unsigned = TxLegacy {
                    chain_id: Some(tx.chain_id),
                    nonce: tx.nonce,
                    gas_price,
                    gas_limit: tx.gas_limit,
                    to: TxKind::Call(tx.to),
                    value: U256::ZERO,
                    input: tx.call_data.clone(),
                };
                let signature = self.signer.sign_hash_sync(&unsigned.signature_hash())?;
                unsigned.into_signed(signature).into()
            }
        };

        Ok(SignedTransaction {
            hash: *envelope.tx_hash(),
            raw: envelope.encoded_2718().into(),
        })
    }
}
