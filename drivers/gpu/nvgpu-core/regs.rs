// SPDX-License-Identifier: GPL-2.0

//! Register definitions.
//!
//! Only the registers and fields the core actually touches are described. Registers whose layout
//! differs between chips are kept out of here and handled by the subsystem HALs.

// Register naming convention. Registers are named as follows:
//
// * `NV_<GROUP>_<REGISTER>` for plain registers,
// * `NV_<GROUP>_<REGISTER>_<CHIP>` where only one chip family uses the register.
//
// `<GROUP>` follows the hardware unit the register belongs to (`PMC`, `PFIFO`, `PPBDMA`, ...).

#[macro_use]
pub(crate) mod macros;

use crate::falcon::PFalconBase;

// PMC

register!(NV_PMC_BOOT_0 @ 0x00000000, "Basic revision information about the GPU" {
    3:0     minor_revision as u8, "Minor revision of the chip";
    7:4     major_revision as u8, "Major revision of the chip";
    23:20   implementation as u8, "Implementation within the architecture";
    28:24   architecture as u8, "Architecture";
    28:20   chipset as u32, "Chipset model";
});

register!(NV_PMC_INTR @ 0x00000100[2; 4], "Pending interrupts: 0 is the stall tree, 1 non-stall" {
    31:0    value as u32;
});

register!(NV_PMC_INTR_EN_SET @ 0x00000160[2; 4] {
    31:0    value as u32;
});

register!(NV_PMC_INTR_EN_CLEAR @ 0x00000180[2; 4] {
    31:0    value as u32;
});

register!(NV_PMC_ENABLE @ 0x00000200, "Engine enables; clearing a bit holds the unit in reset" {
    31:0    value as u32;
});

register!(NV_PMC_ENABLE_PB @ 0x00000204, "PBDMA enables, one bit per PBDMA" {
    31:0    value as u32;
});

register!(NV_PMC_INTR_LTC @ 0x0000001c0, "Pending LTC interrupts, one bit per LTC" {
    31:0    value as u32;
});

// PTIMER

register!(NV_PTIMER_TIME_0 @ 0x00009400 {
    31:0    value as u32;
});

register!(NV_PTIMER_TIME_1 @ 0x00009410 {
    31:0    value as u32;
});

// PTOP

register!(NV_PTOP_SCAL_NUM_GPCS @ 0x00022430 {
    4:0     value as u32;
});

register!(NV_PTOP_SCAL_NUM_TPC_PER_GPC @ 0x00022434 {
    4:0     value as u32;
});

register!(NV_PTOP_SCAL_NUM_FBPS @ 0x00022438 {
    4:0     value as u32;
});

register!(NV_PTOP_DEVICE_INFO @ 0x00022700[64; 4], "Device info table" {
    1:0     entry as u8, "Entry kind, see `DEVICE_INFO_ENTRY_*`";
    31:31   chain as bool, "Following entry describes the same engine";
});

pub(crate) const DEVICE_INFO_ENTRY_NOT_VALID: u8 = 0;
pub(crate) const DEVICE_INFO_ENTRY_DATA: u8 = 1;
pub(crate) const DEVICE_INFO_ENTRY_ENUM: u8 = 2;
pub(crate) const DEVICE_INFO_ENTRY_ENGINE_TYPE: u8 = 3;

bitfield! {
    pub(crate) struct DeviceInfoEnum, "Device info entry of kind `DEVICE_INFO_ENTRY_ENUM`" {
        2:2     reset_valid as bool;
        3:3     intr_valid as bool;
        4:4     runlist_valid as bool;
        5:5     engine_valid as bool;
        13:9    reset_id as u8;
        19:15   intr_id as u8;
        24:21   runlist_id as u8;
        29:26   engine_id as u8;
        31:31   chain as bool;
    }
}

bitfield! {
    pub(crate) struct DeviceInfoEngineType, "Device info entry of kind `DEVICE_INFO_ENTRY_ENGINE_TYPE`" {
        30:2    engine_type as u32;
        31:31   chain as bool;
    }
}

bitfield! {
    pub(crate) struct DeviceInfoData, "Device info entry of kind `DEVICE_INFO_ENTRY_DATA`" {
        23:12   pri_base as u32, "PRI base, in 4 KiB units";
        29:26   inst_id as u8;
        31:31   chain as bool;
    }
}

pub(crate) const DEVICE_INFO_TYPE_GR: u32 = 0;
pub(crate) const DEVICE_INFO_TYPE_NVDEC: u32 = 0x10;
pub(crate) const DEVICE_INFO_TYPE_LCE: u32 = 0x13;

// PFIFO

register!(NV_PFIFO_HOST_NUM_PBDMA @ 0x00002004 {
    4:0     value as u32;
});

register!(NV_PFIFO_INTR_0 @ 0x00002100, "FIFO interrupts, write 1 to clear" {
    0:0     bind_error as bool;
    4:4     pio_error as bool;
    8:8     sched_error as bool;
    16:16   chsw_error as bool;
    23:23   fb_flush_timeout as bool;
    24:24   lb_error as bool;
    27:27   dropped_mmu_fault as bool;
    28:28   mmu_fault as bool;
    29:29   pbdma_intr as bool;
    30:30   runlist_event as bool;
    31:31   channel_intr as bool;
});

register!(NV_PFIFO_INTR_EN_0 @ 0x00002140 {
    31:0    value as u32;
});

register!(NV_PFIFO_INTR_EN_1 @ 0x00002528 {
    31:0    value as u32;
});

register!(NV_PFIFO_INTR_BIND_ERROR @ 0x0000252c {
    7:0     code as u32;
});

register!(NV_PFIFO_INTR_SCHED_ERROR @ 0x0000254c {
    7:0     code as u32;
});

register!(NV_PFIFO_INTR_CHSW_ERROR @ 0x0000256c {
    31:0    value as u32;
});

register!(NV_PFIFO_INTR_MMU_FAULT_ID @ 0x0000259c, "Engines with a pending MMU fault" {
    31:0    value as u32;
});

register!(NV_PFIFO_INTR_PBDMA_ID @ 0x000025a0, "PBDMAs with a pending interrupt" {
    31:0    value as u32;
});

register!(NV_PFIFO_INTR_RUNLIST @ 0x00002a00 {
    31:0    value as u32;
});

register!(NV_PFIFO_ENG_TIMEOUT @ 0x00002a0c {
    30:0    period as u32;
    31:31   detection as bool;
});

register!(NV_PFIFO_PBDMA_MAP @ 0x00002390[32; 4], "Runlists served by each PBDMA" {
    31:0    runlists as u32;
});

register!(NV_PFIFO_RUNLIST_BASE @ 0x00002270 {
    27:0    ptr as u32, "Runlist address >> 12";
    29:28   target as u8;
});

register!(NV_PFIFO_RUNLIST @ 0x00002274 {
    15:0    length as u32;
    23:20   runlist_id as u8;
});

register!(NV_PFIFO_ENG_RUNLIST @ 0x00002284[16; 8] {
    15:0    length as u32;
    20:20   pending as bool;
});

register!(NV_PFIFO_SCHED_DISABLE @ 0x00002630, "Runlists the scheduler is stopped on" {
    31:0    runlists as u32;
});

register!(NV_PFIFO_PREEMPT @ 0x00002634 {
    11:0    id as u32;
    20:20   pending as bool;
    25:24   id_type as u8;
});

pub(crate) const PREEMPT_TYPE_TSG: u8 = 1;

register!(NV_PFIFO_RUNLIST_PREEMPT @ 0x00002638, "Runlist preempt request, one pending bit each" {
    31:0    runlists as u32;
});

register!(NV_PFIFO_ENGINE_STATUS @ 0x00002640[16; 8] {
    11:0    id as u32;
    12:12   id_type as bool, "Set if `id` is a TSG";
    15:13   ctx_status as u8;
    27:16   next_id as u32;
    28:28   next_id_type as bool;
    31:31   busy as bool;
});

register!(NV_PFIFO_PBDMA_STATUS @ 0x00003080[32; 4] {
    11:0    id as u32;
    12:12   id_type as bool, "Set if `id` is a TSG";
    15:13   chan_status as u8;
});

pub(crate) const PBDMA_CHAN_STATUS_INVALID: u8 = 0;

register!(NV_PFIFO_RUNLIST_BASE_LO_TU104 @ 0x00002b00[16; 16] {
    1:0     target as u8;
    31:12   ptr_lo as u32;
});

register!(NV_PFIFO_RUNLIST_BASE_HI_TU104 @ 0x00002b04[16; 16] {
    31:0    ptr_hi as u32;
});

register!(NV_PFIFO_RUNLIST_SUBMIT_TU104 @ 0x00002b08[16; 16] {
    15:0    length as u32;
});

register!(NV_PFIFO_RUNLIST_SUBMIT_INFO_TU104 @ 0x00002b0c[16; 16] {
    15:15   pending as bool;
});

register!(NV_PFIFO_MMU_FAULT_INST @ 0x00002800[32; 16] {
    27:0    ptr as u32;
    29:28   target as u8;
});

register!(NV_PFIFO_MMU_FAULT_LO @ 0x00002804[32; 16] {
    31:0    value as u32;
});

register!(NV_PFIFO_MMU_FAULT_HI @ 0x00002808[32; 16] {
    31:0    value as u32;
});

register!(NV_PFIFO_MMU_FAULT_INFO @ 0x0000280c[32; 16] {
    4:0     fault_type as u8;
    14:8    client as u8;
    19:16   access_type as u8;
    20:20   client_type as bool;
    28:24   gpc_id as u8;
});

// PPBDMA

register!(NV_PPBDMA_METHOD0 @ 0x000400c0[32; 0x2000] {
    31:0    value as u32;
});

register!(NV_PPBDMA_DATA0 @ 0x000400c4[32; 0x2000] {
    31:0    value as u32;
});

register!(NV_PPBDMA_INTR_0 @ 0x00040108[32; 0x2000], "PBDMA interrupts, write 1 to clear" {
    0:0     memreq as bool;
    1:1     memack_timeout as bool;
    2:2     memack_extra as bool;
    3:3     memdat_timeout as bool;
    4:4     memdat_extra as bool;
    5:5     memflush as bool;
    6:6     memop as bool;
    7:7     lbconnect as bool;
    8:8     lbreq as bool;
    9:9     lback_timeout as bool;
    10:10   lback_extra as bool;
    11:11   lbdat_timeout as bool;
    12:12   lbdat_extra as bool;
    13:13   gpfifo as bool;
    14:14   gpptr as bool;
    15:15   gpentry as bool;
    16:16   gpcrc as bool;
    17:17   pbptr as bool;
    18:18   pbentry as bool;
    19:19   pbcrc as bool;
    20:20   xbarconnect as bool;
    21:21   method as bool;
    22:22   methodcrc as bool;
    23:23   device as bool;
    25:25   semaphore as bool;
    26:26   acquire as bool;
    27:27   pri as bool;
    29:29   no_ctxsw_seg as bool;
    30:30   pbseg as bool;
    31:31   signature as bool;
});

register!(NV_PPBDMA_INTR_EN_0 @ 0x0004010c[32; 0x2000] {
    31:0    value as u32;
});

register!(NV_PPBDMA_INTR_STALL @ 0x0004013c[32; 0x2000] {
    31:0    value as u32;
});

register!(NV_PPBDMA_INTR_STALL_1 @ 0x00040140[32; 0x2000] {
    31:0    value as u32;
});

register!(NV_PPBDMA_INTR_1 @ 0x00040148[32; 0x2000], "Host copy engine interrupts, write 1 to clear" {
    31:0    value as u32;
});

register!(NV_PPBDMA_INTR_EN_1 @ 0x0004014c[32; 0x2000] {
    31:0    value as u32;
});

// PCCSR

register!(NV_PCCSR_CHANNEL_INST @ 0x00800000[4096; 8] {
    27:0    ptr as u32, "Instance block address >> 12";
    29:28   target as u8;
    31:31   bind as bool;
});

register!(NV_PCCSR_CHANNEL @ 0x00800004[4096; 8] {
    0:0     enable as bool;
    1:1     next as bool;
    10:10   enable_set as bool;
    11:11   enable_clr as bool;
    22:22   pbdma_faulted_reset as bool;
    23:23   eng_faulted_reset as bool;
    27:24   status as u8;
    28:28   busy as bool;
});

// USERMODE

register!(NV_USERMODE_NOTIFY_CHANNEL_PENDING @ 0x00810090, "Doorbell" {
    31:0    token as u32;
});

// UFLUSH

register!(NV_UFLUSH_FB_FLUSH @ 0x00070000 {
    0:0     pending as bool;
    1:1     outstanding as bool;
});

register!(NV_UFLUSH_L2_SYSMEM_INVALIDATE @ 0x00070004 {
    0:0     pending as bool;
    1:1     outstanding as bool;
});

register!(NV_UFLUSH_L2_FLUSH_DIRTY @ 0x00070010 {
    0:0     pending as bool;
    1:1     outstanding as bool;
});

// PFB

register!(NV_PFB_NISO_INTR @ 0x00100a20, "Hub interrupts" {
    27:27   mmu_replayable_fault as bool;
    28:28   mmu_nonreplayable_fault as bool;
    29:29   mmu_other_fault as bool;
});

register!(NV_PFB_NISO_FLUSH_SYSMEM_ADDR @ 0x00100c10 {
    31:0    adr_39_08 as u32;
});

register!(NV_PFB_PRI_MMU_CTRL @ 0x00100c80 {
    15:15   pri_fifo_empty as bool;
    23:16   pri_fifo_space as u8;
});

register!(NV_PFB_PRI_MMU_INVALIDATE_PDB @ 0x00100cb8 {
    1:1     aperture_sys as bool;
    31:4    addr as u32, "PDB address >> 12";
});

register!(NV_PFB_PRI_MMU_INVALIDATE @ 0x00100cbc {
    0:0     all_va as bool;
    1:1     all_pdb as bool;
    31:31   trigger as bool;
});

register!(NV_PFB_MMU_FAULT_ADDR_LO @ 0x00100e4c {
    1:0     phys_aperture as u8;
    31:12   addr_lo as u32;
});

register!(NV_PFB_MMU_FAULT_ADDR_HI @ 0x00100e50 {
    31:0    addr_hi as u32;
});

register!(NV_PFB_MMU_FAULT_INST_LO @ 0x00100e54 {
    8:0     engine_id as u32;
    11:10   aperture as u8;
    31:12   addr_lo as u32;
});

register!(NV_PFB_MMU_FAULT_INST_HI @ 0x00100e58 {
    31:0    addr_hi as u32;
});

register!(NV_PFB_MMU_FAULT_INFO @ 0x00100e5c {
    4:0     fault_type as u8;
    7:7     replayable as bool;
    14:8    client as u8;
    19:16   access_type as u8;
    20:20   client_type as bool;
    28:24   gpc_id as u8;
    31:31   valid as bool;
});

register!(NV_PFB_MMU_FAULT_STATUS @ 0x00100e60, "Write 1 to `valid` to release the snapshot" {
    31:31   valid as bool;
});

// LTC

register!(NV_PRI_RINGMASTER_ENUM_LTC @ 0x00120074 {
    4:0     count as u32;
});

register!(NV_PLTCG_LTCS_LTSS_CBC_PARAM @ 0x0017e280 {
    15:0    comptags_per_cache_line as u32;
    27:24   cache_line_size as u8, "Cache line size is `512 << cache_line_size`";
    31:28   slices_per_ltc as u8;
});

register!(NV_PLTCG_LTC_LTS_INTR @ 0x0014040c[128; 0x200], "Per slice interrupts, index ltc * 16 + lts" {
    8:8     ecc_sec_error as bool;
    9:9     ecc_ded_error as bool;
});

pub(crate) const LTS_PER_LTC_STRIDE: usize = 16;

// PPRIV

register!(NV_PPRIV_MASTER_RING_COMMAND @ 0x0012004c {
    5:0     cmd as u8;
});

pub(crate) const PRIV_RING_CMD_ACK_INTERRUPT: u8 = 2;

register!(NV_PPRIV_MASTER_RING_INTERRUPT_STATUS0 @ 0x00120058 {
    31:0    value as u32;
});

// PCE

register!(NV_PCE_INTR_STATUS @ 0x00104410[16; 0x1000], "Copy engine interrupts, write 1 to clear" {
    0:0     blockpipe as bool;
    1:1     nonblockpipe as bool;
    2:2     launcherr as bool;
    3:3     invalid_config as bool;
    4:4     mthd_buffer_fault as bool;
});

// PGRAPH

register!(NV_PGRAPH_INTR @ 0x00400100, "GR interrupts, write 1 to clear" {
    0:0     notify as bool;
    1:1     semaphore as bool;
    2:2     semaphore_timeout as bool;
    4:4     illegal_method as bool;
    5:5     illegal_class as bool;
    6:6     illegal_notify as bool;
    8:8     firmware_method as bool;
    19:19   fecs_error as bool;
    20:20   class_error as bool;
    21:21   exception as bool;
});

register!(NV_PGRAPH_EXCEPTION @ 0x00400108 {
    0:0     fe as bool;
    1:1     memfmt as bool;
    24:24   gpc as bool;
});

register!(NV_PGRAPH_NONSTALL_INTR @ 0x00400120 {
    1:1     trap as bool;
});

register!(NV_PGRAPH_INTR_EN @ 0x0040013c {
    31:0    value as u32;
});

register!(NV_PGRAPH_STATUS @ 0x00400700 {
    0:0     busy as bool;
});

register!(NV_PGRAPH_TRAPPED_ADDR @ 0x00400704 {
    13:2    mthd as u32, "Method address >> 2";
    18:16   subch as u8;
});

register!(NV_PGRAPH_TRAPPED_DATA_LO @ 0x00400708 {
    31:0    value as u32;
});

register!(NV_PGRAPH_PRI_FECS_METHOD_DATA @ 0x00409500 {
    31:0    value as u32;
});

register!(NV_PGRAPH_PRI_FECS_METHOD_PUSH @ 0x00409504 {
    11:0    addr as u32;
});

register!(NV_PGRAPH_PRI_FECS_CTXSW_MAILBOX @ 0x00409800[16; 4] {
    31:0    value as u32;
});

register!(NV_PGRAPH_PRI_FECS_CTXSW_MAILBOX_CLEAR @ 0x00409840[16; 4] {
    31:0    value as u32;
});

register!(NV_PGRAPH_PRI_FECS_CURRENT_CTX @ 0x00409b00 {
    27:0    ptr as u32, "Instance block address >> 12";
    29:28   target as u8;
    31:31   valid as bool;
});

register!(NV_PGRAPH_PRI_GPC_FS @ 0x00502608[32; 0x8000] {
    4:0     num_available_tpcs as u32;
});

register!(NV_PGRAPH_PRI_SM_HWW_GLOBAL_ESR @ 0x00504650 {
    31:0    value as u32;
});

register!(NV_PGRAPH_PRI_SM_HWW_WARP_ESR_PC @ 0x00504720 {
    31:0    value as u32;
});

register!(NV_PGRAPH_PRI_SM_HWW_WARP_ESR @ 0x00504730 {
    15:0    error as u32;
});

// PFALCON
//
// Registers common to all falcons, relative to the falcon's base.

register!(NV_PFALCON_FALCON_IRQSSET @ PFalconBase[0x00000000] {
    6:6     swgen0 as bool;
    7:7     swgen1 as bool;
});

register!(NV_PFALCON_FALCON_IRQSCLR @ PFalconBase[0x00000004] {
    31:0    value as u32;
});

register!(NV_PFALCON_FALCON_IRQSTAT @ PFalconBase[0x00000008] {
    4:4     halt as bool;
    5:5     exterr as bool;
    6:6     swgen0 as bool;
    7:7     swgen1 as bool;
});

register!(NV_PFALCON_FALCON_IRQMSET @ PFalconBase[0x00000010] {
    31:0    value as u32;
});

register!(NV_PFALCON_FALCON_IRQMCLR @ PFalconBase[0x00000014] {
    31:0    value as u32;
});

register!(NV_PFALCON_FALCON_IRQDEST @ PFalconBase[0x0000001c] {
    31:0    value as u32;
});

register!(NV_PFALCON_FALCON_MAILBOX0 @ PFalconBase[0x00000040] {
    31:0    value as u32;
});

register!(NV_PFALCON_FALCON_MAILBOX1 @ PFalconBase[0x00000044] {
    31:0    value as u32;
});

register!(NV_PFALCON_FALCON_IDLESTATE @ PFalconBase[0x0000004c] {
    0:0     falcon_busy as bool;
    15:1    ext_busy as u32;
});

register!(NV_PFALCON_FALCON_CPUCTL @ PFalconBase[0x00000100] {
    1:1     startcpu as bool;
    3:3     hreset as bool;
    4:4     halted as bool;
});

register!(NV_PFALCON_FALCON_BOOTVEC @ PFalconBase[0x00000104] {
    31:0    value as u32;
});

register!(NV_PFALCON_FALCON_HWCFG @ PFalconBase[0x00000108] {
    8:0     imem_size as u32, "IMEM size in 256 byte blocks";
    17:9    dmem_size as u32, "DMEM size in 256 byte blocks";
});

register!(NV_PFALCON_FALCON_DMACTL @ PFalconBase[0x0000010c] {
    0:0     require_ctx as bool;
    1:1     dmem_scrubbing as bool;
    2:2     imem_scrubbing as bool;
});

register!(NV_PFALCON_FALCON_HWCFG1 @ PFalconBase[0x0000012c] {
    3:0     core_rev as u8;
    5:4     security_model as u8;
    11:8    imem_ports as u8;
    15:12   dmem_ports as u8;
});

register!(NV_PFALCON_FALCON_IMEMC @ PFalconBase[0x00000180[4; 16]] {
    7:2     offs as u32;
    15:8    blk as u32;
    24:24   aincw as bool;
    25:25   aincr as bool;
    28:28   secure as bool;
});

register!(NV_PFALCON_FALCON_IMEMD @ PFalconBase[0x00000184[4; 16]] {
    31:0    data as u32;
});

register!(NV_PFALCON_FALCON_IMEMT @ PFalconBase[0x00000188[4; 16]] {
    15:0    tag as u32;
});

register!(NV_PFALCON_FALCON_DMEMC @ PFalconBase[0x000001c0[8; 8]] {
    7:2     offs as u32;
    15:8    blk as u32;
    24:24   aincw as bool;
    25:25   aincr as bool;
});

register!(NV_PFALCON_FALCON_DMEMD @ PFalconBase[0x000001c4[8; 8]] {
    31:0    data as u32;
});

register!(NV_PFALCON_FALCON_ENGINE @ PFalconBase[0x000003c0] {
    0:0     reset as bool;
});

register!(NV_PFALCON_FALCON_EMEMC @ PFalconBase[0x00000ac0[4; 8]] {
    7:2     offs as u32;
    15:8    blk as u32;
    24:24   aincw as bool;
    25:25   aincr as bool;
});

register!(NV_PFALCON_FALCON_EMEMD @ PFalconBase[0x00000ac4[4; 8]] {
    31:0    data as u32;
});

// RTOS queues. The PMU and SEC2 place them differently.

register!(NV_PPWR_PMU_QUEUE_HEAD @ 0x0010a4a0[4; 4] {
    31:0    address as u32;
});

register!(NV_PPWR_PMU_QUEUE_TAIL @ 0x0010a4b0[4; 4] {
    31:0    address as u32;
});

register!(NV_PPWR_PMU_MSGQ_HEAD @ 0x0010a4c8 {
    31:0    address as u32;
});

register!(NV_PPWR_PMU_MSGQ_TAIL @ 0x0010a4cc {
    31:0    address as u32;
});

register!(NV_PSEC_QUEUE_HEAD @ 0x00087a00[8; 8] {
    31:0    address as u32;
});

register!(NV_PSEC_QUEUE_TAIL @ 0x00087a04[8; 8] {
    31:0    address as u32;
});

register!(NV_PSEC_MSGQ_HEAD @ 0x00087a30 {
    31:0    address as u32;
});

register!(NV_PSEC_MSGQ_TAIL @ 0x00087a34 {
    31:0    address as u32;
});
