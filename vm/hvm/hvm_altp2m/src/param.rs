// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parameter table hypercalls.

use crate::directory::DomainHandle;
use crate::dispatch::HvmOps;
use crate::guest::GuestHandle;
use crate::guest::copy_from_guest;
use crate::guest::copy_to_guest;
use hvm_defs::DomainId;
use hvm_defs::HvmError;
use hvm_defs::HvmOp;
use hvm_defs::HvmParam;
use hvm_defs::HvmResult;
use hvm_defs::params::HVM_NR_PARAMS;

impl HvmOps {
    /// Handles [`HvmOp::SET_PARAM`] and [`HvmOp::GET_PARAM`].
    pub(crate) fn hvm_param(
        &self,
        caller: DomainId,
        op: HvmOp,
        arg: Option<&dyn GuestHandle>,
    ) -> HvmResult<()> {
        let mut a: HvmParam = copy_from_guest(arg)?;

        if a.index >= HVM_NR_PARAMS {
            return Err(HvmError::InvalidArgument("parameter index out of range"));
        }

        let d = DomainHandle::lock_by_any_id(self.directory.as_ref(), a.domid, caller)?;

        self.xsm
            .hvm_param(caller, &d, op)
            .map_err(HvmError::Denied)?;

        if op == HvmOp::SET_PARAM {
            d.set_param(a.index, a.value)?;
            tracing::debug!(domain = %d.id(), index = a.index, value = a.value, "set hvm param");
        } else {
            a.value = d.param(a.index)?;
            copy_to_guest(arg, &a)?;
        }
        Ok(())
    }
}
